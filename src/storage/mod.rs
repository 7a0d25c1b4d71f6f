//! Context Store boundary and persistence.
//!
//! The engine treats document storage as an external collaborator: it fetches
//! the current snapshot when a participant first touches a context, and
//! persists the authoritative content after operations commit (write-through
//! when the session auto-saves, otherwise on the periodic flush). Comments
//! also persist here since they survive session end.

mod sled_store;

pub use sled_store::SledStore;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// External contract for document snapshots.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Fetch the current content of a context, if it exists.
    async fn get_document(&self, context_id: &str) -> StorageResult<Option<String>>;

    /// Persist the authoritative content of a context.
    async fn set_document(&self, context_id: &str, content: &str) -> StorageResult<()>;
}

/// Configuration for the sled-backed store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/engine.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

/// In-memory context store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryContextStore {
    documents: DashMap<String, String>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, context_id: &str, content: &str) {
        self.documents.insert(context_id.to_string(), content.to_string());
    }

    pub fn get(&self, context_id: &str) -> Option<String> {
        self.documents.get(context_id).map(|c| c.clone())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get_document(&self, context_id: &str) -> StorageResult<Option<String>> {
        Ok(self.documents.get(context_id).map(|c| c.clone()))
    }

    async fn set_document(&self, context_id: &str, content: &str) -> StorageResult<()> {
        self.documents.insert(context_id.to_string(), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryContextStore::new();
        assert_eq!(store.get_document("ctx").await.unwrap(), None);

        store.set_document("ctx", "content").await.unwrap();
        assert_eq!(
            store.get_document("ctx").await.unwrap(),
            Some("content".to_string())
        );
    }

    #[test]
    fn test_storage_config() {
        let config = StorageConfig::new("/tmp/test.sled").with_cache_size(1024);
        assert_eq!(config.path, "/tmp/test.sled");
        assert_eq!(config.cache_size, 1024);
    }
}
