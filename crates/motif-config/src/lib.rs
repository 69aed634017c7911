//! Layered configuration store, grounded on the teacher engine's
//! `ConfigStore`: defaults < file < environment, merged on every read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_task_interval_secs")]
    pub task_interval_secs: u64,
    #[serde(default = "default_workflow_interval_secs")]
    pub workflow_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_async_timeout_minutes")]
    pub task_timeout_minutes_async: u64,
    #[serde(default = "default_sync_timeout_minutes")]
    pub task_timeout_minutes_sync: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub async_poll_interval_secs: u64,
}

fn default_task_interval_secs() -> u64 {
    5
}
fn default_workflow_interval_secs() -> u64 {
    10
}
fn default_batch_size() -> usize {
    20
}
fn default_concurrency() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_async_timeout_minutes() -> u64 {
    120
}
fn default_sync_timeout_minutes() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_interval_secs: default_task_interval_secs(),
            workflow_interval_secs: default_workflow_interval_secs(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            task_timeout_minutes_async: default_async_timeout_minutes(),
            task_timeout_minutes_sync: default_sync_timeout_minutes(),
            async_poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEndpoint>,
    #[serde(default)]
    pub object_store_root: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    file_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&file_path).await.unwrap_or_else(|_| empty_object());
        let store = Self {
            file_path,
            layers: Arc::new(RwLock::new(ConfigLayers {
                file,
                env: env_layer(),
                runtime: empty_object(),
            })),
        };
        Ok(store)
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    /// Apply an in-memory override without touching disk (used by tests
    /// and by hot-reload call sites).
    pub async fn patch_runtime(&self, patch: Value) -> AppConfig {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get().await
    }

    pub async fn persist(&self, config: &AppConfig) -> anyhow::Result<()> {
        let value = serde_json::to_value(config)?;
        {
            self.layers.write().await.file = value.clone();
        }
        write_json_file(&self.file_path, &value).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn env_layer() -> Value {
    let mut root = Map::new();
    if let Ok(root_dir) = std::env::var("MOTIF_OBJECT_STORE_ROOT") {
        root.insert("object_store_root".to_string(), Value::String(root_dir));
    }
    if let Ok(interval) = std::env::var("MOTIF_SCHEDULER_TASK_INTERVAL_SECS") {
        if let Ok(n) = interval.parse::<u64>() {
            let mut scheduler = Map::new();
            scheduler.insert("task_interval_secs".to_string(), Value::from(n));
            root.insert("scheduler".to_string(), Value::Object(scheduler));
        }
    }
    Value::Object(root)
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(
                    base_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_layer_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();
        let mut cfg = store.get().await;
        cfg.scheduler.batch_size = 42;
        store.persist(&cfg).await.unwrap();

        let reloaded = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reloaded.get().await.scheduler.batch_size, 42);
    }

    #[tokio::test]
    async fn runtime_layer_overrides_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json")).await.unwrap();
        let cfg = store
            .patch_runtime(serde_json::json!({"scheduler": {"concurrency": 99}}))
            .await;
        assert_eq!(cfg.scheduler.concurrency, 99);
    }
}
