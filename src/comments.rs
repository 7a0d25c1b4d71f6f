//! Threaded comments anchored to context positions.
//!
//! Comments are independent of the operation log and survive session end,
//! so they live in persistent storage rather than in session state.
//! Mentions trigger an outward notification event but are not validated
//! against session membership; a mention may name a user who is not
//! currently in the session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::session::{ContextId, ParticipantId, UserId};
use crate::storage::SledStore;

/// Content length bounds
pub const MIN_COMMENT_LEN: usize = 1;
pub const MAX_COMMENT_LEN: usize = 1000;

/// An emoji reaction on a comment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub participant_id: ParticipantId,
    pub emoji: String,
}

/// A position-anchored annotation on a context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub context_id: ContextId,
    pub author_id: ParticipantId,
    pub content: String,
    pub position: usize,
    pub mentions: Vec<UserId>,
    pub resolved: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub reactions: Vec<Reaction>,
}

impl Comment {
    pub fn new(
        context_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        position: usize,
        mentions: Vec<UserId>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            position,
            mentions,
            resolved: false,
            created_at: now,
            updated_at: now,
            reactions: Vec::new(),
        }
    }
}

/// Persistent comment store. Permission checks happen at the call sites
/// (gateway / HTTP handlers) through the participant roster.
pub struct CommentStore {
    store: Arc<SledStore>,
}

impl CommentStore {
    pub fn new(store: Arc<SledStore>) -> Self {
        Self { store }
    }

    /// Create a comment after validating content and anchoring.
    pub fn add_comment(
        &self,
        context_id: &str,
        author_id: &str,
        content: &str,
        position: usize,
        mentions: Vec<UserId>,
    ) -> EngineResult<Comment> {
        let len = content.chars().count();
        if len < MIN_COMMENT_LEN || len > MAX_COMMENT_LEN {
            return Err(EngineError::InvalidOperation(format!(
                "comment content must be {}-{} characters, got {}",
                MIN_COMMENT_LEN, MAX_COMMENT_LEN, len
            )));
        }

        let comment = Comment::new(context_id, author_id, content, position, mentions);
        self.store.put_comment(&comment)?;

        if !comment.mentions.is_empty() {
            tracing::info!(
                comment = %comment.id,
                mentioned = ?comment.mentions,
                "mention notification"
            );
        }

        Ok(comment)
    }

    /// All comments on a context, oldest first
    pub fn comments_for_context(&self, context_id: &str) -> EngineResult<Vec<Comment>> {
        Ok(self.store.comments_for_context(context_id)?)
    }

    pub fn get(&self, comment_id: &str) -> EngineResult<Comment> {
        self.store
            .get_comment(comment_id)?
            .ok_or_else(|| EngineError::InvalidOperation(format!("unknown comment: {}", comment_id)))
    }

    /// Mark resolved. Idempotent: resolving an already-resolved comment is a
    /// no-op returning the same state.
    pub fn resolve(&self, comment_id: &str) -> EngineResult<Comment> {
        self.set_resolved(comment_id, true)
    }

    /// Reopen a resolved comment. Idempotent like `resolve`.
    pub fn reopen(&self, comment_id: &str) -> EngineResult<Comment> {
        self.set_resolved(comment_id, false)
    }

    fn set_resolved(&self, comment_id: &str, resolved: bool) -> EngineResult<Comment> {
        let mut comment = self.get(comment_id)?;
        if comment.resolved == resolved {
            return Ok(comment);
        }
        comment.resolved = resolved;
        comment.updated_at = chrono::Utc::now().timestamp_millis();
        self.store.put_comment(&comment)?;
        Ok(comment)
    }

    /// Append a reaction
    pub fn add_reaction(&self, comment_id: &str, participant_id: &str, emoji: &str) -> EngineResult<Comment> {
        let mut comment = self.get(comment_id)?;
        comment.reactions.push(Reaction {
            participant_id: participant_id.to_string(),
            emoji: emoji.to_string(),
        });
        comment.updated_at = chrono::Utc::now().timestamp_millis();
        self.store.put_comment(&comment)?;
        Ok(comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use tempfile::{tempdir, TempDir};

    // The TempDir guard must outlive the store or sled loses its directory.
    fn test_store() -> (CommentStore, TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        (CommentStore::new(Arc::new(SledStore::open(config).unwrap())), dir)
    }

    #[test]
    fn test_add_and_list() {
        let (store, _dir) = test_store();

        let c1 = store
            .add_comment("ctx-1", "p1", "First observation", 10, vec![])
            .unwrap();
        store
            .add_comment("ctx-1", "p2", "Second", 20, vec!["user-9".to_string()])
            .unwrap();
        store.add_comment("ctx-2", "p1", "Elsewhere", 0, vec![]).unwrap();

        let comments = store.comments_for_context("ctx-1").unwrap();
        assert_eq!(comments.len(), 2);
        assert!(comments.iter().any(|c| c.id == c1.id));
        assert!(comments.iter().all(|c| !c.resolved && c.context_id == "ctx-1"));
    }

    #[test]
    fn test_content_length_validation() {
        let (store, _dir) = test_store();

        assert!(store.add_comment("ctx", "p1", "", 0, vec![]).is_err());

        let too_long = "x".repeat(1001);
        assert!(store.add_comment("ctx", "p1", &too_long, 0, vec![]).is_err());

        let max = "x".repeat(1000);
        assert!(store.add_comment("ctx", "p1", &max, 0, vec![]).is_ok());
    }

    #[test]
    fn test_resolve_reopen_idempotent() {
        let (store, _dir) = test_store();
        let comment = store.add_comment("ctx", "p1", "Fix this", 5, vec![]).unwrap();

        let resolved = store.resolve(&comment.id).unwrap();
        assert!(resolved.resolved);

        // Resolving again is a no-op returning the same state.
        let again = store.resolve(&comment.id).unwrap();
        assert!(again.resolved);
        assert_eq!(again.updated_at, resolved.updated_at);

        let reopened = store.reopen(&comment.id).unwrap();
        assert!(!reopened.resolved);
        let again = store.reopen(&comment.id).unwrap();
        assert!(!again.resolved);
        assert_eq!(again.updated_at, reopened.updated_at);
    }

    #[test]
    fn test_reactions_accumulate() {
        let (store, _dir) = test_store();
        let comment = store.add_comment("ctx", "p1", "Nice", 5, vec![]).unwrap();

        store.add_reaction(&comment.id, "p2", "👍").unwrap();
        let updated = store.add_reaction(&comment.id, "p3", "🎉").unwrap();

        assert_eq!(updated.reactions.len(), 2);
        assert_eq!(updated.reactions[0].participant_id, "p2");
    }

    #[test]
    fn test_mentions_not_validated_against_membership() {
        let (store, _dir) = test_store();
        let comment = store
            .add_comment("ctx", "p1", "cc @stranger", 5, vec!["not-a-member".to_string()])
            .unwrap();
        assert_eq!(comment.mentions, vec!["not-a-member".to_string()]);
    }
}
