//! Per-context operation sequencer.
//!
//! Exactly one operation is being sequenced per (session, context) at any
//! instant: each context gets one worker task fed by an mpsc channel, which
//! gives strict FIFO processing and a total order with no lock held outside
//! the worker. Contexts and sessions proceed independently and in parallel;
//! there is no cross-context synchronization anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use super::conflict::{ConflictAction, ConflictNotice, ConflictQueue};
use super::transform::transform_against;
use super::{OperationInput, OperationKind, SequencedOperation};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{ServerMessage, SessionEvent};
use crate::session::{ConflictResolution, ContextId, SessionId, SessionSettings};
use crate::storage::ContextStore;

/// Commands handled by a context worker, strictly in arrival order.
enum Command {
    Submit {
        participant_id: String,
        op: OperationInput,
        reply: oneshot::Sender<EngineResult<SubmitOutcome>>,
    },
    Resolve {
        conflict_id: String,
        action: ConflictAction,
        merged: Option<OperationInput>,
        resolver_id: String,
        resolver_may_manage: bool,
        reply: oneshot::Sender<EngineResult<ResolveOutcome>>,
    },
    Flush,
}

/// Result of submitting an operation
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Committed(SequencedOperation),
    Conflict(ConflictNotice),
}

/// Result of resolving a queued conflict
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Applied(SequencedOperation),
    Rejected(String),
}

struct WorkerHandle {
    tx: mpsc::Sender<Command>,
}

/// Session-scoped sequencer owning one worker per context.
pub struct Sequencer {
    session_id: SessionId,
    strategy: ConflictResolution,
    auto_save: bool,
    workers: DashMap<ContextId, WorkerHandle>,
    store: Arc<dyn ContextStore>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    channel_capacity: usize,
}

impl Sequencer {
    pub fn new(
        session_id: impl Into<String>,
        settings: &SessionSettings,
        store: Arc<dyn ContextStore>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            strategy: settings.conflict_resolution,
            auto_save: settings.auto_save,
            workers: DashMap::new(),
            store,
            events,
            closed: AtomicBool::new(false),
            channel_capacity: 256,
        }
    }

    /// Sequence an operation. The caller has already authorized the
    /// participant; malformed operations are rejected here before any
    /// sequence number is consumed.
    pub async fn submit(
        &self,
        participant_id: &str,
        context_id: &str,
        mut op: OperationInput,
    ) -> EngineResult<SubmitOutcome> {
        op.normalize()?;
        let tx = self.worker(context_id).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Submit {
            participant_id: participant_id.to_string(),
            op,
            reply: reply_tx,
        })
        .await
        .map_err(|_| EngineError::SessionInactive(self.session_id.clone()))?;

        reply_rx
            .await
            .map_err(|_| EngineError::SessionInactive(self.session_id.clone()))?
    }

    /// Settle a queued conflict. `resolver_may_manage` reflects the
    /// resolver's `manageSettings` permission; authorship of either side of
    /// the conflict is checked by the worker, which owns the queue.
    pub async fn resolve(
        &self,
        context_id: &str,
        conflict_id: &str,
        action: ConflictAction,
        merged: Option<OperationInput>,
        resolver_id: &str,
        resolver_may_manage: bool,
    ) -> EngineResult<ResolveOutcome> {
        let tx = self.worker(context_id).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Resolve {
            conflict_id: conflict_id.to_string(),
            action,
            merged,
            resolver_id: resolver_id.to_string(),
            resolver_may_manage,
            reply: reply_tx,
        })
        .await
        .map_err(|_| EngineError::SessionInactive(self.session_id.clone()))?;

        reply_rx
            .await
            .map_err(|_| EngineError::SessionInactive(self.session_id.clone()))?
    }

    /// Ask every worker to persist its document if dirty. Fire-and-forget;
    /// a full worker queue just means a save is already behind real work.
    pub fn flush_all(&self) {
        for entry in self.workers.iter() {
            let _ = entry.value().tx.try_send(Command::Flush);
        }
    }

    /// Drop all worker handles. In-flight commands drain (already-sequenced
    /// operations complete); new submissions are rejected.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.workers.clear();
    }

    /// Get or lazily spawn the worker for a context. The document must exist
    /// in the context store; an unknown context never gets a worker.
    async fn worker(&self, context_id: &str) -> EngineResult<mpsc::Sender<Command>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::SessionInactive(self.session_id.clone()));
        }

        if let Some(handle) = self.workers.get(context_id) {
            return Ok(handle.tx.clone());
        }

        let content = self
            .store
            .get_document(context_id)
            .await?
            .ok_or_else(|| EngineError::ContextNotFound(context_id.to_string()))?;

        // Two concurrent first-touches may both fetch; only one worker wins
        // the map slot, the loser's spawn never happens.
        let handle = self.workers.entry(context_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            let worker = ContextWorker {
                session_id: self.session_id.clone(),
                context_id: context_id.to_string(),
                strategy: self.strategy,
                auto_save: self.auto_save,
                store: self.store.clone(),
                events: self.events.clone(),
                content,
                next_sequence: 1,
                log: Vec::new(),
                conflicts: ConflictQueue::new(),
                dirty: false,
            };
            tokio::spawn(worker.run(rx));
            WorkerHandle { tx }
        });

        Ok(handle.tx.clone())
    }
}

/// Single-writer state for one (session, context) pair.
struct ContextWorker {
    session_id: SessionId,
    context_id: ContextId,
    strategy: ConflictResolution,
    auto_save: bool,
    store: Arc<dyn ContextStore>,
    events: broadcast::Sender<SessionEvent>,
    content: String,
    next_sequence: u64,
    log: Vec<SequencedOperation>,
    conflicts: ConflictQueue,
    dirty: bool,
}

impl ContextWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(
            session = %self.session_id,
            context = %self.context_id,
            "sequencer worker started"
        );

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Submit { participant_id, op, reply } => {
                    let result = self.handle_submit(&participant_id, op).await;
                    let _ = reply.send(result);
                }
                Command::Resolve {
                    conflict_id,
                    action,
                    merged,
                    resolver_id,
                    resolver_may_manage,
                    reply,
                } => {
                    let result = self
                        .handle_resolve(&conflict_id, action, merged, &resolver_id, resolver_may_manage)
                        .await;
                    let _ = reply.send(result);
                }
                Command::Flush => self.save_if_dirty().await,
            }
        }

        // Session closed or worker evicted: persist whatever is outstanding.
        self.save_if_dirty().await;
        debug!(
            session = %self.session_id,
            context = %self.context_id,
            "sequencer worker stopped"
        );
    }

    async fn handle_submit(
        &mut self,
        participant_id: &str,
        mut op: OperationInput,
    ) -> EngineResult<SubmitOutcome> {
        let base = op.base_sequence.unwrap_or(self.next_sequence - 1);

        match self.strategy {
            ConflictResolution::LastWriteWins => {
                let committed = self.commit(participant_id, op).await;
                Ok(SubmitOutcome::Committed(committed))
            }
            ConflictResolution::OperationalTransform => {
                let unseen: Vec<SequencedOperation> = self
                    .log
                    .iter()
                    .filter(|c| c.sequence_number > base)
                    .cloned()
                    .collect();
                for committed in &unseen {
                    transform_against(&mut op, committed);
                }
                let committed = self.commit(participant_id, op).await;
                Ok(SubmitOutcome::Committed(committed))
            }
            ConflictResolution::Manual => {
                if let Some(peer) = self.conflicts.detect(&op, base, &self.log) {
                    let notice = self.conflicts.enqueue(&self.context_id, participant_id, op, peer);
                    self.emit(
                        Some(participant_id),
                        ServerMessage::ConflictDetected {
                            conflict: notice.clone(),
                        },
                    );
                    Ok(SubmitOutcome::Conflict(notice))
                } else {
                    let committed = self.commit(participant_id, op).await;
                    Ok(SubmitOutcome::Committed(committed))
                }
            }
        }
    }

    async fn handle_resolve(
        &mut self,
        conflict_id: &str,
        action: ConflictAction,
        merged: Option<OperationInput>,
        resolver_id: &str,
        resolver_may_manage: bool,
    ) -> EngineResult<ResolveOutcome> {
        let pending = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| EngineError::InvalidOperation(format!("unknown conflict: {}", conflict_id)))?;

        let is_author = pending.participant_id == resolver_id
            || pending.conflicts_with.participant_id() == resolver_id;
        if !resolver_may_manage && !is_author {
            return Err(EngineError::Forbidden("manageSettings".to_string()));
        }

        let settled = self.conflicts.settle(conflict_id, action)?;

        match action {
            ConflictAction::Apply => {
                let mut op = merged.unwrap_or(settled.op);
                op.normalize()?;
                let committed = self.commit(&settled.participant_id, op).await;
                self.emit(
                    None,
                    ServerMessage::ConflictResolved {
                        conflict_id: conflict_id.to_string(),
                        context_id: self.context_id.clone(),
                        applied: true,
                        sequence_number: Some(committed.sequence_number),
                    },
                );
                Ok(ResolveOutcome::Applied(committed))
            }
            ConflictAction::Reject => {
                self.emit(
                    None,
                    ServerMessage::ConflictResolved {
                        conflict_id: conflict_id.to_string(),
                        context_id: self.context_id.clone(),
                        applied: false,
                        sequence_number: None,
                    },
                );
                Ok(ResolveOutcome::Rejected(conflict_id.to_string()))
            }
        }
    }

    /// Assign the next sequence number, apply to the document, append to the
    /// log, and broadcast. Operations are immutable once sequenced.
    async fn commit(&mut self, participant_id: &str, op: OperationInput) -> SequencedOperation {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let committed = SequencedOperation {
            session_id: self.session_id.clone(),
            context_id: self.context_id.clone(),
            participant_id: participant_id.to_string(),
            sequence_number,
            kind: op.kind,
            position: op.position,
            content: op.content,
            length: op.length,
            target_position: op.target_position,
        };

        apply_operation(&mut self.content, &committed);
        self.log.push(committed.clone());
        self.dirty = true;

        if self.auto_save {
            self.save_if_dirty().await;
        }

        self.emit(
            Some(participant_id),
            ServerMessage::OperationCommitted {
                operation: committed.clone(),
            },
        );

        committed
    }

    async fn save_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        match self.store.set_document(&self.context_id, &self.content).await {
            Ok(()) => {
                self.dirty = false;
                debug!(context = %self.context_id, "document persisted");
            }
            Err(e) => {
                // The operation is already committed; persistence retries on
                // the next flush tick.
                error!(context = %self.context_id, "failed to persist document: {}", e);
            }
        }
    }

    fn emit(&self, origin: Option<&str>, message: ServerMessage) {
        let event = SessionEvent {
            origin: origin.map(|s| s.to_string()),
            message,
        };
        if self.events.send(event).is_err() {
            warn!(session = %self.session_id, "no event subscribers for sequencer broadcast");
        }
    }
}

/// Byte index of the `position`-th character, clamped to the end.
fn byte_index(s: &str, position: usize) -> usize {
    s.char_indices().nth(position).map(|(i, _)| i).unwrap_or(s.len())
}

/// Apply a committed operation to document content. Positions are character
/// offsets; out-of-range positions and lengths clamp to the document end,
/// with saturating arithmetic so a huge length cannot wrap the range.
pub fn apply_operation(content: &mut String, op: &SequencedOperation) {
    match op.kind {
        OperationKind::Insert => {
            let idx = byte_index(content, op.position);
            content.insert_str(idx, op.content.as_deref().unwrap_or_default());
        }
        OperationKind::Delete => {
            let start = byte_index(content, op.position);
            let end = byte_index(content, op.position.saturating_add(op.length.unwrap_or(0)));
            content.replace_range(start..end, "");
        }
        OperationKind::Replace => {
            let start = byte_index(content, op.position);
            let end = byte_index(content, op.position.saturating_add(op.length.unwrap_or(0)));
            content.replace_range(start..end, op.content.as_deref().unwrap_or_default());
        }
        OperationKind::Move => {
            let length = op.length.unwrap_or(0);
            let start = byte_index(content, op.position);
            let end = byte_index(content, op.position.saturating_add(length));
            let moved: String = content[start..end].to_string();
            content.replace_range(start..end, "");

            // Target is expressed in pre-removal coordinates.
            let target = op.target_position.unwrap_or(op.position);
            let landing = if target >= op.position.saturating_add(length) {
                target - length
            } else if target > op.position {
                op.position
            } else {
                target
            };
            let idx = byte_index(content, landing);
            content.insert_str(idx, &moved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryContextStore;

    fn sequencer(strategy: ConflictResolution) -> (Sequencer, broadcast::Receiver<SessionEvent>) {
        let store = Arc::new(MemoryContextStore::new());
        store.put("ctx-1", "hello world");
        let settings = SessionSettings {
            conflict_resolution: strategy,
            auto_save: false,
            ..Default::default()
        };
        let (events, rx) = broadcast::channel(64);
        (Sequencer::new("session-1", &settings, store, events), rx)
    }

    fn insert(position: usize, content: &str, base: Option<u64>) -> OperationInput {
        OperationInput {
            kind: OperationKind::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
            target_position: None,
            base_sequence: base,
        }
    }

    fn committed(outcome: SubmitOutcome) -> SequencedOperation {
        match outcome {
            SubmitOutcome::Committed(op) => op,
            SubmitOutcome::Conflict(n) => panic!("unexpected conflict: {}", n.conflict_id),
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_strictly_increase_without_gaps() {
        let (seq, _rx) = sequencer(ConflictResolution::LastWriteWins);

        for expected in 1..=10u64 {
            let outcome = seq.submit("p1", "ctx-1", insert(0, "x", None)).await.unwrap();
            assert_eq!(committed(outcome).sequence_number, expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_context_is_rejected() {
        let (seq, _rx) = sequencer(ConflictResolution::LastWriteWins);

        let err = seq.submit("p1", "nope", insert(0, "x", None)).await.unwrap_err();
        assert!(matches!(err, EngineError::ContextNotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_operation_consumes_no_sequence_number() {
        let (seq, _rx) = sequencer(ConflictResolution::LastWriteWins);

        let bad = OperationInput {
            kind: OperationKind::Delete,
            position: 0,
            content: None,
            length: None,
            target_position: None,
            base_sequence: None,
        };
        assert!(seq.submit("p1", "ctx-1", bad).await.is_err());

        let outcome = seq.submit("p1", "ctx-1", insert(0, "x", None)).await.unwrap();
        assert_eq!(committed(outcome).sequence_number, 1);
    }

    #[tokio::test]
    async fn test_last_write_wins_applies_literal_positions() {
        let store = Arc::new(MemoryContextStore::new());
        store.put("ctx-1", "hello world");
        let settings = SessionSettings {
            conflict_resolution: ConflictResolution::LastWriteWins,
            auto_save: true,
            ..Default::default()
        };
        let (events, _rx) = broadcast::channel(64);
        let seq = Sequencer::new("session-1", &settings, store.clone(), events);

        // Both inserts claim position 5 and neither saw the other; under
        // last-write-wins the second is applied at its literal position,
        // not shifted.
        let a = seq.submit("p1", "ctx-1", insert(5, "foo", Some(0))).await.unwrap();
        let b = seq.submit("p2", "ctx-1", insert(5, "bar", Some(0))).await.unwrap();
        assert_eq!(committed(a).sequence_number, 1);
        let b = committed(b);
        assert_eq!(b.sequence_number, 2);
        assert_eq!(b.position, 5);

        assert_eq!(store.get("ctx-1").unwrap(), "hellobarfoo world");
    }

    #[tokio::test]
    async fn test_operational_transform_shifts_concurrent_insert() {
        let store = Arc::new(MemoryContextStore::new());
        store.put("ctx-1", "hello world");
        let settings = SessionSettings {
            conflict_resolution: ConflictResolution::OperationalTransform,
            auto_save: true,
            ..Default::default()
        };
        let (events, _rx) = broadcast::channel(64);
        let seq = Sequencer::new("session-1", &settings, store.clone(), events);

        seq.submit("p1", "ctx-1", insert(5, "foo", Some(0))).await.unwrap();
        let b = seq.submit("p2", "ctx-1", insert(5, "bar", Some(0))).await.unwrap();

        // The second insert is shifted past the first one's content.
        assert_eq!(committed(b).position, 8);
        assert_eq!(store.get("ctx-1").unwrap(), "hellofoobar world");
    }

    #[tokio::test]
    async fn test_manual_strategy_queues_overlap() {
        let (seq, mut rx) = sequencer(ConflictResolution::Manual);

        let a = seq.submit("p1", "ctx-1", insert(5, "foo", Some(0))).await.unwrap();
        committed(a);

        // p2 had not observed seq 1 and targets the same region.
        let b = seq.submit("p2", "ctx-1", insert(5, "bar", Some(0))).await.unwrap();
        let notice = match b {
            SubmitOutcome::Conflict(n) => n,
            SubmitOutcome::Committed(_) => panic!("expected conflict"),
        };
        assert_eq!(notice.participant_id, "p2");

        // A conflictDetected event went out on the bus.
        let mut saw_conflict = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.message, ServerMessage::ConflictDetected { .. }) {
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);

        // Resolution by a manager applies the queued operation.
        let outcome = seq
            .resolve("ctx-1", &notice.conflict_id, ConflictAction::Apply, None, "owner", true)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Applied(op) if op.sequence_number == 2));
    }

    #[tokio::test]
    async fn test_manual_resolution_requires_manager_or_author() {
        let (seq, _rx) = sequencer(ConflictResolution::Manual);

        seq.submit("p1", "ctx-1", insert(5, "foo", Some(0))).await.unwrap();
        let b = seq.submit("p2", "ctx-1", insert(5, "bar", Some(0))).await.unwrap();
        let notice = match b {
            SubmitOutcome::Conflict(n) => n,
            SubmitOutcome::Committed(_) => panic!("expected conflict"),
        };

        let err = seq
            .resolve("ctx-1", &notice.conflict_id, ConflictAction::Reject, None, "bystander", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        // The author of the queued operation may resolve it.
        let outcome = seq
            .resolve("ctx-1", &notice.conflict_id, ConflictAction::Reject, None, "p2", false)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_oversized_delete_clamps_and_worker_survives() {
        let (seq, _rx) = sequencer(ConflictResolution::LastWriteWins);

        // A length near usize::MAX must clamp to the document end rather
        // than panic the context worker.
        let huge = OperationInput {
            kind: OperationKind::Delete,
            position: 2,
            content: None,
            length: Some(usize::MAX),
            target_position: None,
            base_sequence: None,
        };
        let outcome = seq.submit("p1", "ctx-1", huge).await.unwrap();
        assert_eq!(committed(outcome).sequence_number, 1);

        // The context keeps sequencing afterwards.
        let outcome = seq.submit("p1", "ctx-1", insert(0, "x", None)).await.unwrap();
        assert_eq!(committed(outcome).sequence_number, 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_operations() {
        let (seq, _rx) = sequencer(ConflictResolution::LastWriteWins);
        seq.submit("p1", "ctx-1", insert(0, "x", None)).await.unwrap();

        seq.shutdown();

        let err = seq.submit("p1", "ctx-1", insert(0, "y", None)).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionInactive(_)));
    }

    #[test]
    fn test_apply_operations() {
        let op = |kind, position, content: Option<&str>, length, target| SequencedOperation {
            session_id: "s".to_string(),
            context_id: "c".to_string(),
            participant_id: "p".to_string(),
            sequence_number: 1,
            kind,
            position,
            content: content.map(|s| s.to_string()),
            length,
            target_position: target,
        };

        let mut doc = "hello world".to_string();
        apply_operation(&mut doc, &op(OperationKind::Insert, 5, Some(","), None, None));
        assert_eq!(doc, "hello, world");

        apply_operation(&mut doc, &op(OperationKind::Delete, 5, None, Some(1), None));
        assert_eq!(doc, "hello world");

        apply_operation(&mut doc, &op(OperationKind::Replace, 6, Some("rust!"), Some(5), None));
        assert_eq!(doc, "hello rust!");

        // Move "hello " (6 chars at 0) to the end (pre-removal position 11).
        apply_operation(&mut doc, &op(OperationKind::Move, 0, None, Some(6), Some(11)));
        assert_eq!(doc, "rust!hello ");

        // Out-of-range insert clamps to the end.
        let mut doc = "abc".to_string();
        apply_operation(&mut doc, &op(OperationKind::Insert, 99, Some("!"), None, None));
        assert_eq!(doc, "abc!");

        // A length that would wrap position + length clamps instead.
        let mut doc = "hello".to_string();
        apply_operation(&mut doc, &op(OperationKind::Delete, 2, None, Some(usize::MAX), None));
        assert_eq!(doc, "he");
    }
}
