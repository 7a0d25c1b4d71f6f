//! Operation sequencing engine.
//!
//! Accepts edit operations, assigns monotonic sequence numbers per
//! (session, context), and applies the session's conflict-resolution
//! strategy before an operation is considered committed.

pub mod conflict;
pub mod sequencer;
pub mod transform;

pub use conflict::{ConflictAction, ConflictNotice, ConflictPeer};
pub use sequencer::{ResolveOutcome, Sequencer, SubmitOutcome};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::session::{ContextId, ParticipantId, SessionId};

/// Kind of edit applied to a context's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    Move,
}

/// An edit operation as submitted by a client, before sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInput {
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Destination for `move`, in pre-removal coordinates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_position: Option<usize>,
    /// Highest committed sequence number the sender had observed when it
    /// issued this operation. Absent means "observed everything".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sequence: Option<u64>,
}

impl OperationInput {
    /// Validate and normalize. Rejected operations never consume a sequence
    /// number. Normalization materializes the effective range length for
    /// `replace` so later transforms work on concrete ranges.
    pub fn normalize(&mut self) -> EngineResult<()> {
        match self.kind {
            OperationKind::Insert => {
                let content = self.content.as_deref().unwrap_or_default();
                if content.is_empty() {
                    return Err(EngineError::InvalidOperation(
                        "insert requires non-empty content".to_string(),
                    ));
                }
            }
            OperationKind::Replace => {
                let content = self
                    .content
                    .as_deref()
                    .ok_or_else(|| {
                        EngineError::InvalidOperation("replace requires content".to_string())
                    })?;
                if self.length.is_none() {
                    self.length = Some(content.chars().count());
                }
            }
            OperationKind::Delete => {
                if self.length.is_none() {
                    return Err(EngineError::InvalidOperation(
                        "delete requires length".to_string(),
                    ));
                }
            }
            OperationKind::Move => {
                if self.length.is_none() {
                    return Err(EngineError::InvalidOperation(
                        "move requires length".to_string(),
                    ));
                }
                if self.target_position.is_none() {
                    return Err(EngineError::InvalidOperation(
                        "move requires targetPosition".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Character span this operation touches, used for overlap detection.
    /// Inserts occupy at least one position so two inserts at the same spot
    /// count as overlapping. The end saturates so an oversized length
    /// cannot wrap around.
    pub fn range(&self) -> (usize, usize) {
        let len = match self.kind {
            OperationKind::Insert => self.content.as_deref().map(|c| c.chars().count()).unwrap_or(0),
            _ => self.length.unwrap_or(0),
        };
        (self.position, self.position.saturating_add(len.max(1)))
    }
}

/// A committed, immutable operation in a context's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOperation {
    pub session_id: SessionId,
    pub context_id: ContextId,
    pub participant_id: ParticipantId,
    pub sequence_number: u64,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_position: Option<usize>,
}

impl SequencedOperation {
    pub fn range(&self) -> (usize, usize) {
        let len = match self.kind {
            OperationKind::Insert => self.content.as_deref().map(|c| c.chars().count()).unwrap_or(0),
            _ => self.length.unwrap_or(0),
        };
        (self.position, self.position.saturating_add(len.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(kind: OperationKind) -> OperationInput {
        OperationInput {
            kind,
            position: 0,
            content: None,
            length: None,
            target_position: None,
            base_sequence: None,
        }
    }

    #[test]
    fn test_insert_requires_content() {
        let mut op = input(OperationKind::Insert);
        assert!(op.normalize().is_err());

        op.content = Some(String::new());
        assert!(op.normalize().is_err());

        op.content = Some("x".to_string());
        assert!(op.normalize().is_ok());
    }

    #[test]
    fn test_delete_requires_length() {
        let mut op = input(OperationKind::Delete);
        assert!(op.normalize().is_err());

        op.length = Some(0);
        assert!(op.normalize().is_ok());
    }

    #[test]
    fn test_move_requires_length_and_target() {
        let mut op = input(OperationKind::Move);
        op.length = Some(3);
        assert!(op.normalize().is_err());

        op.target_position = Some(10);
        assert!(op.normalize().is_ok());
    }

    #[test]
    fn test_replace_length_defaults_to_content() {
        let mut op = input(OperationKind::Replace);
        op.content = Some("abc".to_string());
        op.normalize().unwrap();
        assert_eq!(op.length, Some(3));
    }

    #[test]
    fn test_range_end_saturates_for_oversized_length() {
        let mut op = input(OperationKind::Delete);
        op.position = 2;
        op.length = Some(usize::MAX);
        assert_eq!(op.range(), (2, usize::MAX));
    }

    #[test]
    fn test_wire_format_uses_operation_field() {
        let mut op = input(OperationKind::Insert);
        op.content = Some("hi".to_string());
        op.position = 5;

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "insert");
        assert_eq!(json["position"], 5);
    }
}
