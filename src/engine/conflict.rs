//! Pending-conflict queue for the manual resolution strategy.
//!
//! Under manual resolution an operation that overlaps an uncommitted or
//! unobserved-committed operation on the same region is not auto-applied.
//! It is queued, a `conflictDetected` event names both operations, and a
//! participant with `manageSettings` (or one of the authors) resolves it.
//! Each pending entry walks an explicit Pending -> Resolved | Rejected
//! state machine.

use serde::{Deserialize, Serialize};

use super::{OperationInput, SequencedOperation};
use crate::error::{EngineError, EngineResult};
use crate::session::{ContextId, ParticipantId};

/// Resolution verdict for a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    /// Commit the pending operation (or a supplied merged replacement).
    Apply,
    /// Discard the pending operation.
    Reject,
}

/// State of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictState {
    Pending,
    Resolved,
    Rejected,
}

/// The operation a pending one collided with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConflictPeer {
    Committed {
        sequence_number: u64,
        participant_id: ParticipantId,
    },
    Pending {
        conflict_id: String,
        participant_id: ParticipantId,
    },
}

impl ConflictPeer {
    pub fn participant_id(&self) -> &str {
        match self {
            ConflictPeer::Committed { participant_id, .. } => participant_id,
            ConflictPeer::Pending { participant_id, .. } => participant_id,
        }
    }
}

/// Wire notice naming both sides of a detected conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotice {
    pub conflict_id: String,
    pub context_id: ContextId,
    pub participant_id: ParticipantId,
    #[serde(flatten)]
    pub operation: OperationInput,
    pub conflicts_with: ConflictPeer,
}

/// A queued operation awaiting resolution
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub conflict_id: String,
    pub participant_id: ParticipantId,
    pub op: OperationInput,
    pub conflicts_with: ConflictPeer,
    pub state: ConflictState,
    pub detected_at: i64,
}

/// Per-context queue of unresolved operations.
///
/// Owned by the context's sequencer worker, so access is already serialized.
#[derive(Default)]
pub struct ConflictQueue {
    entries: Vec<PendingOperation>,
}

fn ranges_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find what an incoming operation collides with: a still-pending entry,
    /// or a committed operation the sender had not observed.
    pub fn detect(
        &self,
        op: &OperationInput,
        base_sequence: u64,
        log: &[SequencedOperation],
    ) -> Option<ConflictPeer> {
        let range = op.range();

        if let Some(pending) = self
            .entries
            .iter()
            .filter(|p| p.state == ConflictState::Pending)
            .find(|p| ranges_overlap(range, p.op.range()))
        {
            return Some(ConflictPeer::Pending {
                conflict_id: pending.conflict_id.clone(),
                participant_id: pending.participant_id.clone(),
            });
        }

        log.iter()
            .filter(|c| c.sequence_number > base_sequence)
            .find(|c| ranges_overlap(range, c.range()))
            .map(|c| ConflictPeer::Committed {
                sequence_number: c.sequence_number,
                participant_id: c.participant_id.clone(),
            })
    }

    /// Queue an operation and return the notice to broadcast.
    pub fn enqueue(
        &mut self,
        context_id: &str,
        participant_id: &str,
        op: OperationInput,
        conflicts_with: ConflictPeer,
    ) -> ConflictNotice {
        let conflict_id = uuid::Uuid::new_v4().to_string();
        let notice = ConflictNotice {
            conflict_id: conflict_id.clone(),
            context_id: context_id.to_string(),
            participant_id: participant_id.to_string(),
            operation: op.clone(),
            conflicts_with: conflicts_with.clone(),
        };

        self.entries.push(PendingOperation {
            conflict_id,
            participant_id: participant_id.to_string(),
            op,
            conflicts_with,
            state: ConflictState::Pending,
            detected_at: chrono::Utc::now().timestamp(),
        });

        notice
    }

    pub fn get(&self, conflict_id: &str) -> Option<&PendingOperation> {
        self.entries.iter().find(|p| p.conflict_id == conflict_id)
    }

    /// Transition a pending entry to Resolved or Rejected, returning a clone
    /// of the entry as it was when pending. Re-resolving a settled entry is
    /// an error, not a state change.
    pub fn settle(&mut self, conflict_id: &str, action: ConflictAction) -> EngineResult<PendingOperation> {
        let entry = self
            .entries
            .iter_mut()
            .find(|p| p.conflict_id == conflict_id)
            .ok_or_else(|| {
                EngineError::InvalidOperation(format!("unknown conflict: {}", conflict_id))
            })?;

        if entry.state != ConflictState::Pending {
            return Err(EngineError::InvalidOperation(format!(
                "conflict {} is already settled",
                conflict_id
            )));
        }

        let snapshot = entry.clone();
        entry.state = match action {
            ConflictAction::Apply => ConflictState::Resolved,
            ConflictAction::Reject => ConflictState::Rejected,
        };
        Ok(snapshot)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|p| p.state == ConflictState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OperationKind;

    fn insert(position: usize, content: &str) -> OperationInput {
        OperationInput {
            kind: OperationKind::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
            target_position: None,
            base_sequence: None,
        }
    }

    fn committed(position: usize, length: usize, seq: u64) -> SequencedOperation {
        SequencedOperation {
            session_id: "s".to_string(),
            context_id: "c".to_string(),
            participant_id: "author-1".to_string(),
            sequence_number: seq,
            kind: OperationKind::Delete,
            position,
            content: None,
            length: Some(length),
            target_position: None,
        }
    }

    #[test]
    fn test_detect_against_unobserved_committed() {
        let queue = ConflictQueue::new();
        let log = vec![committed(5, 4, 3)];

        // Sender observed through seq 2; the committed delete at [5, 9) is
        // concurrent with an insert at 6.
        let peer = queue.detect(&insert(6, "x"), 2, &log);
        assert!(matches!(peer, Some(ConflictPeer::Committed { sequence_number: 3, .. })));

        // Sender that already observed seq 3 sees no conflict.
        assert!(queue.detect(&insert(6, "x"), 3, &log).is_none());
    }

    #[test]
    fn test_detect_against_pending() {
        let mut queue = ConflictQueue::new();
        queue.enqueue("ctx", "p1", insert(5, "foo"), ConflictPeer::Committed {
            sequence_number: 1,
            participant_id: "p0".to_string(),
        });

        let peer = queue.detect(&insert(5, "bar"), u64::MAX, &[]);
        assert!(matches!(peer, Some(ConflictPeer::Pending { .. })));

        let peer = queue.detect(&insert(40, "far away"), u64::MAX, &[]);
        assert!(peer.is_none());
    }

    #[test]
    fn test_settle_state_machine() {
        let mut queue = ConflictQueue::new();
        let notice = queue.enqueue("ctx", "p1", insert(5, "foo"), ConflictPeer::Committed {
            sequence_number: 1,
            participant_id: "p0".to_string(),
        });

        assert_eq!(queue.pending_count(), 1);

        let settled = queue.settle(&notice.conflict_id, ConflictAction::Apply).unwrap();
        assert_eq!(settled.participant_id, "p1");
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(
            queue.get(&notice.conflict_id).unwrap().state,
            ConflictState::Resolved
        );

        // Settling twice is an error.
        assert!(queue.settle(&notice.conflict_id, ConflictAction::Reject).is_err());
    }

    #[test]
    fn test_settle_unknown_conflict() {
        let mut queue = ConflictQueue::new();
        assert!(queue.settle("nope", ConflictAction::Apply).is_err());
    }

    #[test]
    fn test_settled_entries_do_not_block_new_operations() {
        let mut queue = ConflictQueue::new();
        let notice = queue.enqueue("ctx", "p1", insert(5, "foo"), ConflictPeer::Committed {
            sequence_number: 1,
            participant_id: "p0".to_string(),
        });
        queue.settle(&notice.conflict_id, ConflictAction::Reject).unwrap();

        assert!(queue.detect(&insert(5, "bar"), u64::MAX, &[]).is_none());
    }
}
