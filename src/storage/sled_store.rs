//! Sled-backed store for context documents and comments.
//!
//! Documents are stored as raw UTF-8 bytes keyed by context id. Comments are
//! bincode records keyed by comment id, with the context id embedded in the
//! record; they persist independently of any session.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sled::{Db, Tree};

use super::{ContextStore, StorageConfig, StorageError, StorageResult};
use crate::comments::Comment;

const TREE_CONTEXTS: &str = "contexts";
const TREE_COMMENTS: &str = "comments";

/// Embedded persistent store for the engine
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    contexts: Tree,
    comments: Tree,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let contexts = db.open_tree(TREE_CONTEXTS)?;
        let comments = db.open_tree(TREE_COMMENTS)?;

        Ok(Self {
            db: Arc::new(db),
            contexts,
            comments,
        })
    }

    pub fn context_exists(&self, context_id: &str) -> StorageResult<bool> {
        Ok(self.contexts.contains_key(context_id.as_bytes())?)
    }

    /// Save or overwrite a comment record
    pub fn put_comment(&self, comment: &Comment) -> StorageResult<()> {
        let bytes = bincode::serialize(comment)?;
        self.comments.insert(comment.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_comment(&self, comment_id: &str) -> StorageResult<Option<Comment>> {
        match self.comments.get(comment_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All comments attached to a context, oldest first
    pub fn comments_for_context(&self, context_id: &str) -> StorageResult<Vec<Comment>> {
        let mut found = Vec::new();
        for item in self.comments.iter() {
            let (_, value) = item?;
            let comment: Comment = bincode::deserialize(&value)?;
            if comment.context_id == context_id {
                found.push(comment);
            }
        }
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    /// Force all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for SledStore {
    async fn get_document(&self, context_id: &str) -> StorageResult<Option<String>> {
        match self.contexts.get(context_id.as_bytes())? {
            Some(bytes) => {
                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|_| StorageError::Corruption(context_id.to_string()))?;
                Ok(Some(content))
            }
            None => Ok(None),
        }
    }

    async fn set_document(&self, context_id: &str, content: &str) -> StorageResult<()> {
        self.contexts.insert(context_id.as_bytes(), content.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    // The TempDir guard must outlive the store or sled loses its directory.
    fn test_store() -> (SledStore, TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        (SledStore::open(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_document_roundtrip() {
        let (store, _dir) = test_store();

        assert_eq!(store.get_document("ctx-1").await.unwrap(), None);
        assert!(!store.context_exists("ctx-1").unwrap());

        store.set_document("ctx-1", "hello").await.unwrap();
        assert_eq!(
            store.get_document("ctx-1").await.unwrap(),
            Some("hello".to_string())
        );
        assert!(store.context_exists("ctx-1").unwrap());

        store.set_document("ctx-1", "hello world").await.unwrap();
        assert_eq!(
            store.get_document("ctx-1").await.unwrap(),
            Some("hello world".to_string())
        );
    }

    #[test]
    fn test_comment_persistence() {
        let (store, _dir) = test_store();

        let comment = Comment::new("ctx-1", "author-1", "Looks good", 12, vec![]);
        store.put_comment(&comment).unwrap();

        let loaded = store.get_comment(&comment.id).unwrap().unwrap();
        assert_eq!(loaded.content, "Looks good");
        assert_eq!(loaded.context_id, "ctx-1");

        let other = Comment::new("ctx-2", "author-1", "Different context", 0, vec![]);
        store.put_comment(&other).unwrap();

        let listed = store.comments_for_context("ctx-1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, comment.id);
    }
}
