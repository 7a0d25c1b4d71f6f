//! Ephemeral presence: cursors, selections, typing indicators.
//!
//! Presence is best-effort by design. Nothing here is persisted; an engine
//! restart clears it all and reconnecting clients repopulate it. Cursor
//! state expires if not refreshed within the presence timeout, and typing
//! flags auto-clear after a few seconds without an explicit stop message.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::session::{ContextId, ParticipantId, SessionId};

/// Default lifetime of a cursor that is not being refreshed
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(30);

/// Default lifetime of a typing flag
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(4);

/// Expiry windows for presence state
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub cursor_ttl: Duration,
    pub typing_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_ttl: DEFAULT_CURSOR_TTL,
            typing_ttl: DEFAULT_TYPING_TTL,
        }
    }
}

/// A selection range within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

/// A participant's cursor within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    /// Milliseconds since epoch of the last refresh
    pub updated_at: i64,
    #[serde(skip)]
    refreshed: Option<Instant>,
}

impl CursorState {
    fn refreshed_at(&self) -> Instant {
        self.refreshed.unwrap_or_else(Instant::now)
    }
}

/// A live typing indicator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub participant_id: ParticipantId,
    pub context_id: ContextId,
}

/// Per-session tracker of cursors and typing flags.
pub struct PresenceTracker {
    session_id: SessionId,
    config: PresenceConfig,
    cursors: DashMap<ParticipantId, CursorState>,
    typing: DashMap<(ParticipantId, ContextId), Instant>,
}

impl PresenceTracker {
    pub fn new(session_id: impl Into<String>, config: PresenceConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            cursors: DashMap::new(),
            typing: DashMap::new(),
        }
    }

    /// Upsert a cursor and restart its expiry window.
    pub fn update_cursor(
        &self,
        participant_id: &str,
        context_id: Option<ContextId>,
        position: Option<usize>,
        selection: Option<Selection>,
    ) -> CursorState {
        let state = CursorState {
            session_id: self.session_id.clone(),
            participant_id: participant_id.to_string(),
            context_id,
            position,
            selection,
            updated_at: chrono::Utc::now().timestamp_millis(),
            refreshed: Some(Instant::now()),
        };
        self.cursors.insert(participant_id.to_string(), state.clone());
        state
    }

    /// All cursors that have been refreshed within the expiry window.
    pub fn cursors(&self) -> Vec<CursorState> {
        self.cursors
            .iter()
            .filter(|entry| entry.refreshed_at().elapsed() <= self.config.cursor_ttl)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn cursor_for(&self, participant_id: &str) -> Option<CursorState> {
        self.cursors
            .get(participant_id)
            .filter(|c| c.refreshed_at().elapsed() <= self.config.cursor_ttl)
            .map(|c| c.clone())
    }

    /// Set the short-lived typing flag; renewed by repetition, cleared by
    /// expiry. No stop message is required for correctness.
    pub fn mark_typing(&self, participant_id: &str, context_id: &str) {
        self.typing.insert(
            (participant_id.to_string(), context_id.to_string()),
            Instant::now(),
        );
    }

    /// All unexpired typing indicators
    pub fn typing(&self) -> Vec<TypingIndicator> {
        self.typing
            .iter()
            .filter(|entry| entry.value().elapsed() <= self.config.typing_ttl)
            .map(|entry| TypingIndicator {
                participant_id: entry.key().0.clone(),
                context_id: entry.key().1.clone(),
            })
            .collect()
    }

    /// Drop all presence state for a participant (on disconnect).
    pub fn clear_participant(&self, participant_id: &str) {
        self.cursors.remove(participant_id);
        self.typing.retain(|(pid, _), _| pid != participant_id);
    }

    /// Remove expired entries. Reads already filter on expiry; this just
    /// keeps the maps from accumulating dead participants.
    pub fn sweep(&self) {
        let cursor_ttl = self.config.cursor_ttl;
        self.cursors
            .retain(|_, c| c.refreshed_at().elapsed() <= cursor_ttl);
        let typing_ttl = self.config.typing_ttl;
        self.typing.retain(|_, at| at.elapsed() <= typing_ttl);
    }

    /// Drop everything (session closed).
    pub fn clear(&self) {
        self.cursors.clear();
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(cursor_ms: u64, typing_ms: u64) -> PresenceTracker {
        PresenceTracker::new(
            "session-1",
            PresenceConfig {
                cursor_ttl: Duration::from_millis(cursor_ms),
                typing_ttl: Duration::from_millis(typing_ms),
            },
        )
    }

    #[test]
    fn test_cursor_upsert_and_read() {
        let tracker = tracker(1000, 1000);

        tracker.update_cursor("p1", Some("ctx-1".to_string()), Some(10), None);
        tracker.update_cursor(
            "p2",
            Some("ctx-1".to_string()),
            Some(3),
            Some(Selection { start: 3, end: 9 }),
        );

        let cursors = tracker.cursors();
        assert_eq!(cursors.len(), 2);

        let p2 = tracker.cursor_for("p2").unwrap();
        assert_eq!(p2.selection, Some(Selection { start: 3, end: 9 }));
    }

    #[test]
    fn test_stale_cursor_is_absent() {
        let tracker = tracker(10, 1000);

        tracker.update_cursor("p1", None, Some(5), None);
        assert_eq!(tracker.cursors().len(), 1);

        std::thread::sleep(Duration::from_millis(25));
        assert!(tracker.cursors().is_empty());
        assert!(tracker.cursor_for("p1").is_none());
    }

    #[test]
    fn test_refresh_restarts_expiry() {
        let tracker = tracker(40, 1000);

        tracker.update_cursor("p1", None, Some(5), None);
        std::thread::sleep(Duration::from_millis(25));
        tracker.update_cursor("p1", None, Some(6), None);
        std::thread::sleep(Duration::from_millis(25));

        // Still alive: the second update restarted the window.
        assert_eq!(tracker.cursors().len(), 1);
    }

    #[test]
    fn test_typing_auto_clears() {
        let tracker = tracker(1000, 10);

        tracker.mark_typing("p1", "ctx-1");
        assert_eq!(tracker.typing().len(), 1);

        std::thread::sleep(Duration::from_millis(25));
        assert!(tracker.typing().is_empty());
    }

    #[test]
    fn test_clear_participant() {
        let tracker = tracker(1000, 1000);

        tracker.update_cursor("p1", None, Some(5), None);
        tracker.mark_typing("p1", "ctx-1");
        tracker.update_cursor("p2", None, Some(8), None);

        tracker.clear_participant("p1");

        assert_eq!(tracker.cursors().len(), 1);
        assert!(tracker.typing().is_empty());
    }

    #[test]
    fn test_sweep_drops_expired_entries() {
        let tracker = tracker(10, 10);

        tracker.update_cursor("p1", None, Some(5), None);
        tracker.mark_typing("p1", "ctx-1");
        std::thread::sleep(Duration::from_millis(25));

        tracker.sweep();
        assert!(tracker.cursors().is_empty());
        assert!(tracker.typing().is_empty());
    }
}
