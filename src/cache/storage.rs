//! Durable blob backends for the persistent cache.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend has been torn down")]
    TornDown,
    #[error("storage channel closed")]
    ChannelClosed,
    #[error("storage I/O failed")]
    Io(#[from] std::io::Error),
    #[error("cache blob is malformed")]
    Malformed(#[source] anyhow::Error),
    #[error("failed to encode cache blob")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Conditions that are expected during shutdown and not worth reporting.
    pub fn is_benign(&self) -> bool {
        matches!(self, StoreError::TornDown | StoreError::ChannelClosed)
    }
}

/// A durable key → blob store. The cache keeps its whole state under a
/// single key.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the blob under `key`. Readers see either the old or the new
    /// blob, never a mix.
    async fn write(&self, key: &str, blob: String) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One JSON file per key inside a directory.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Refuse all further operations with [`StoreError::TornDown`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::TornDown);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, blob: String) -> Result<(), StoreError> {
        self.ensure_open()?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp, blob.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        trace!(path = %path.display(), bytes = blob.len(), "Cache blob written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage, used when persistence is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: DashMap<String, String>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the owning channel going away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.blobs.get(key).map(|b| b.value().clone())
    }

    pub fn set(&self, key: &str, blob: impl Into<String>) {
        self.blobs.insert(key.to_owned(), blob.into());
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, blob: String) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.blobs.insert(key.to_owned(), blob);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.blobs.remove(key);
        Ok(())
    }
}
