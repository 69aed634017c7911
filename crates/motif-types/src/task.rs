use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AccountId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    VideoMotion,
    VideoLipsync,
    AudioTts,
    Img2img,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::VideoMotion,
        TaskType::VideoLipsync,
        TaskType::AudioTts,
        TaskType::Img2img,
    ];

    /// Closed enum -> mode mapping (spec §3 "mode derived from type").
    pub fn mode(&self) -> TaskMode {
        match self {
            TaskType::AudioTts => TaskMode::Sync,
            _ => TaskMode::Async,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::VideoMotion => "video_motion",
            TaskType::VideoLipsync => "video_lipsync",
            TaskType::AudioTts => "audio_tts",
            TaskType::Img2img => "img2img",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Partial
                | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Video,
    Audio,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResource {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub url: String,
    pub is_input: bool,
    #[serde(default)]
    pub metadata: Value,
}

/// The provider's idea of how much work it actually did, used by
/// per-token pricing to compute `actualCost`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageReport {
    /// Seconds of media, tokens, or pieces depending on task type.
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<TaskResource>,
    pub estimated_cost: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_usage: Option<UsageReport>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_poll_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency counter; this workspace's stand-in for a
    /// database row lock (see DESIGN.md).
    #[serde(default)]
    pub version: u64,
}

impl Task {
    pub fn idempotency_key(&self) -> String {
        format!("task:{}", self.id)
    }
}

/// One requested input or output when creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub kind: ResourceKind,
    /// A `temp/{accountId}/{uploadId}/{filename}` object-store key.
    pub temp_key: String,
    pub filename: String,
}
