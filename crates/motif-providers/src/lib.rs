//! Component C — the task provider adapter interface: `submit`/`poll`
//! against an opaque external model-inference provider, plus the
//! registry that selects one adapter per task type.
//!
//! Grounded on the teacher engine's `Provider`/`ProviderRegistry` pair: a
//! trait-object registry behind an `RwLock<Vec<Arc<dyn _>>>`, rebuildable
//! from config without a process restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};

use motif_types::{EngineError, EngineResult, TaskMode, TaskType};

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub external_id: String,
    /// Synchronous providers return outputs directly from `submit`,
    /// skipping the `processing` state entirely.
    pub sync_outputs: Option<Vec<ProviderResource>>,
    pub sync_usage: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ProviderResource {
    pub url: String,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub enum PollResult {
    Pending,
    Done {
        outputs: Vec<ProviderResource>,
        /// Usage the provider reports for this job, used by per-token
        /// pricing to compute `actualCost`.
        usage: f64,
    },
    Failed {
        terminal: bool,
        message: String,
    },
}

/// Errors from `submit` partition into retryable and terminal so the
/// Task Engine can apply spec.md §4.E's retry/refund policy.
#[derive(Debug, Clone)]
pub enum SubmitError {
    Retryable(String),
    Terminal(String),
}

impl From<SubmitError> for EngineError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Retryable(msg) => EngineError::Transient(msg),
            SubmitError::Terminal(msg) => EngineError::TerminalProvider {
                kind: "submit_rejected".to_string(),
                message: msg,
            },
        }
    }
}

/// One provider per task type. `poll` errors (network failures, not a
/// `Failed` result) must not change task state — callers should retry
/// the poll itself on the next tick rather than fail the task.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn submit(
        &self,
        idempotency_key: &str,
        inputs: &[String],
        config: &Value,
    ) -> Result<SubmitOutcome, SubmitError>;

    async fn poll(&self, external_id: &str, config: &Value) -> anyhow::Result<PollResult>;
}

/// Caps concurrent `submit`/`poll` calls per provider (spec.md §5).
pub struct ProviderHandle {
    provider: Arc<dyn TaskProvider>,
    semaphore: Arc<Semaphore>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn TaskProvider>, max_concurrent: usize) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn submit(
        &self,
        idempotency_key: &str,
        inputs: &[String],
        config: &Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            SubmitError::Retryable("provider semaphore closed".to_string())
        })?;
        self.provider.submit(idempotency_key, inputs, config).await
    }

    pub async fn poll(&self, external_id: &str, config: &Value) -> anyhow::Result<PollResult> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("provider semaphore closed"))?;
        self.provider.poll(external_id, config).await
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<TaskType, Arc<ProviderHandle>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, provider: Arc<dyn TaskProvider>, max_concurrent: usize) {
        let task_type = provider.task_type();
        self.providers
            .write()
            .await
            .insert(task_type, Arc::new(ProviderHandle::new(provider, max_concurrent)));
    }

    pub async fn reload(&self, providers: Vec<(Arc<dyn TaskProvider>, usize)>) {
        let mut rebuilt = HashMap::new();
        for (provider, max_concurrent) in providers {
            rebuilt.insert(
                provider.task_type(),
                Arc::new(ProviderHandle::new(provider, max_concurrent)),
            );
        }
        *self.providers.write().await = rebuilt;
    }

    pub async fn get(&self, task_type: TaskType) -> EngineResult<Arc<ProviderHandle>> {
        self.providers
            .read()
            .await
            .get(&task_type)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("no provider for {task_type:?}")))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `reqwest`-backed adapter for a provider that exposes a two-call HTTP
/// contract (`POST /jobs`, `GET /jobs/{id}`).
pub struct HttpTaskProvider {
    task_type: TaskType,
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskProvider {
    pub fn new(task_type: TaskType, base_url: impl Into<String>) -> Self {
        Self {
            task_type,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TaskProvider for HttpTaskProvider {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn submit(
        &self,
        idempotency_key: &str,
        inputs: &[String],
        config: &Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        let body = serde_json::json!({
            "idempotencyKey": idempotency_key,
            "inputs": inputs,
            "config": config,
        });
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmitError::Retryable(e.to_string()))?;

        if response.status().is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(SubmitError::Terminal(message));
        }
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SubmitError::Retryable(message));
        }

        let parsed: HttpSubmitResponse = response
            .json()
            .await
            .map_err(|e| SubmitError::Retryable(e.to_string()))?;
        Ok(SubmitOutcome {
            external_id: parsed.id,
            sync_outputs: None,
            sync_usage: None,
        })
    }

    async fn poll(&self, external_id: &str, _config: &Value) -> anyhow::Result<PollResult> {
        let response = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, external_id))
            .send()
            .await?;
        let parsed: HttpPollResponse = response.json().await?;
        Ok(match parsed.status.as_str() {
            "pending" | "running" => PollResult::Pending,
            "done" => PollResult::Done {
                outputs: parsed
                    .outputs
                    .into_iter()
                    .map(|o| ProviderResource {
                        url: o.url,
                        mime: o.mime,
                    })
                    .collect(),
                usage: parsed.usage.unwrap_or(0.0),
            },
            "failed" => PollResult::Failed {
                terminal: true,
                message: parsed.error.unwrap_or_else(|| "provider reported failure".into()),
            },
            other => PollResult::Failed {
                terminal: true,
                message: format!("unknown provider status {other}"),
            },
        })
    }
}

#[derive(serde::Deserialize)]
struct HttpSubmitResponse {
    id: String,
}

#[derive(serde::Deserialize)]
struct HttpPollResponse {
    status: String,
    #[serde(default)]
    outputs: Vec<HttpOutput>,
    #[serde(default)]
    usage: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct HttpOutput {
    url: String,
    mime: String,
}

/// In-memory provider used by tests and local development.
pub struct MockProvider {
    task_type: TaskType,
    behavior: MockBehavior,
}

#[derive(Clone)]
pub enum MockBehavior {
    Succeeds { outputs: Vec<ProviderResource>, usage: f64 },
    RejectsTerminal(String),
    FailsRetryableForever,
}

impl MockProvider {
    pub fn new(task_type: TaskType, behavior: MockBehavior) -> Self {
        Self { task_type, behavior }
    }
}

#[async_trait]
impl TaskProvider for MockProvider {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn submit(
        &self,
        idempotency_key: &str,
        _inputs: &[String],
        _config: &Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        match &self.behavior {
            MockBehavior::RejectsTerminal(msg) => Err(SubmitError::Terminal(msg.clone())),
            MockBehavior::FailsRetryableForever => {
                Err(SubmitError::Retryable("provider unreachable".to_string()))
            }
            MockBehavior::Succeeds { outputs, usage } => {
                let (sync_outputs, sync_usage) = if self.task_type.mode() == TaskMode::Sync {
                    (Some(outputs.clone()), Some(*usage))
                } else {
                    (None, None)
                };
                Ok(SubmitOutcome {
                    external_id: format!("ext-{idempotency_key}"),
                    sync_outputs,
                    sync_usage,
                })
            }
        }
    }

    async fn poll(&self, _external_id: &str, _config: &Value) -> anyhow::Result<PollResult> {
        match &self.behavior {
            MockBehavior::Succeeds { outputs, usage } => Ok(PollResult::Done {
                outputs: outputs.clone(),
                usage: *usage,
            }),
            MockBehavior::RejectsTerminal(msg) => Ok(PollResult::Failed {
                terminal: true,
                message: msg.clone(),
            }),
            MockBehavior::FailsRetryableForever => {
                anyhow::bail!("provider unreachable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_resolves_by_task_type() {
        let registry = ProviderRegistry::new();
        let provider = Arc::new(MockProvider::new(
            TaskType::VideoMotion,
            MockBehavior::Succeeds {
                outputs: vec![ProviderResource {
                    url: "https://example/out.mp4".into(),
                    mime: "video/mp4".into(),
                }],
                usage: 5.0,
            },
        ));
        registry.register(provider, 4).await;

        let handle = registry.get(TaskType::VideoMotion).await.unwrap();
        let outcome = handle.submit("task:1", &[], &Value::Null).await.unwrap();
        assert!(outcome.external_id.starts_with("ext-"));

        assert!(registry.get(TaskType::AudioTts).await.is_err());
    }

    #[tokio::test]
    async fn terminal_submit_error_maps_to_terminal_provider() {
        let provider = MockProvider::new(
            TaskType::VideoMotion,
            MockBehavior::RejectsTerminal("policy violation".into()),
        );
        let err = provider.submit("k", &[], &Value::Null).await.unwrap_err();
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::TerminalProvider { .. }));
    }
}
