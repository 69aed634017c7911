//! Component D — object storage path conventions and a filesystem-backed
//! implementation.
//!
//! Layout, grounded on the teacher's `storage_paths` canonical-root
//! convention:
//!   `input/{accountId}/{taskType}/{taskId}/{filename}`
//!   `output/{accountId}/{taskType}/{taskId}/{filename}`
//!   `temp/{accountId}/{uploadId}/{filename}`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use motif_types::{AccountId, TaskId, TaskType};

pub fn input_key(account_id: &AccountId, task_type: TaskType, task_id: &TaskId, filename: &str) -> String {
    format!("input/{account_id}/{}/{task_id}/{filename}", task_type.as_str())
}

pub fn output_key(account_id: &AccountId, task_type: TaskType, task_id: &TaskId, filename: &str) -> String {
    format!("output/{account_id}/{}/{task_id}/{filename}", task_type.as_str())
}

pub fn temp_key(account_id: &AccountId, upload_id: &str, filename: &str) -> String {
    format!("temp/{account_id}/{upload_id}/{filename}")
}

/// An object store backend, abstracted behind a trait so the motif-tasks
/// engine does not depend on the filesystem directly.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    async fn get_bytes(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Best-effort public URL for a stored object, used when handing
    /// resources to providers or callers.
    fn public_url(&self, key: &str) -> String;
}

/// `tokio::fs`-backed store rooted at a configured directory. Paths are
/// joined, never interpolated through shell or SQL, so the only
/// traversal risk is a caller-controlled key; `sanitize_key` rejects
/// `..` components before any path is touched.
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        sanitize_key(key)?;
        Ok(self.root.join(key))
    }
}

fn sanitize_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        anyhow::bail!("object key must not be empty");
    }
    for component in Path::new(key).components() {
        use std::path::Component;
        match component {
            Component::Normal(_) => {}
            _ => anyhow::bail!("object key {key} contains an illegal path component"),
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url.trim_end_matches('/'))
    }
}

/// Downloads `url` and writes the response body into `store` at
/// `dest_key`, used to ingest a provider's output into the durable
/// output area once a task completes. `file://` URLs are read straight
/// off disk instead of through `reqwest`, the same local-provider path
/// `MockProvider` exercises in tests.
pub async fn fetch_into(store: &dyn ObjectStore, url: &str, dest_key: &str) -> anyhow::Result<()> {
    let bytes = if let Some(path) = url.strip_prefix("file://") {
        tokio::fs::read(path).await?
    } else {
        reqwest::get(url).await?.error_for_status()?.bytes().await?.to_vec()
    };
    store.put_bytes(dest_key, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_bytes_through_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "https://cdn.example");
        let account_id = AccountId::new();
        let task_id = TaskId::new();
        let key = output_key(&account_id, TaskType::VideoMotion, &task_id, "out.mp4");

        store.put_bytes(&key, b"frame-data").await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get_bytes(&key).await.unwrap(), b"frame-data");
        assert!(store.public_url(&key).starts_with("https://cdn.example/output/"));

        store.delete(&key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "https://cdn.example");
        let err = store.put_bytes("../escape", b"x").await.unwrap_err();
        assert!(err.to_string().contains("illegal path component"));
    }
}
