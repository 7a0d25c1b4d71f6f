//! Session data model and lifecycle.
//!
//! A session is a bounded collaborative workspace: settings, an ordered
//! roster of participants, and per-context operation logs. The registry in
//! [`registry`] owns the arena of sessions; all mutation of a session's state
//! goes through that session's own components.

pub mod participant;
pub mod registry;

pub use participant::{Participant, ParticipantRoster, Permission, Role};
pub use registry::{EngineConfig, SessionRegistry, SessionState};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::presence::CursorState;

/// Unique identifier for a session
pub type SessionId = String;

/// Externally-verified user identity
pub type UserId = String;

/// Identifier of a participant record within a session
pub type ParticipantId = String;

/// Identifier of a shared document ("context")
pub type ContextId = String;

/// Bounds enforced on session creation
pub const MAX_SESSION_NAME_LEN: usize = 100;
pub const MAX_PARTICIPANT_LIMIT: usize = 50;

/// Policy governing how concurrent operations on the same content are
/// reconciled into one final state. Selected per session at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Apply strictly in arrival order at literal positions; no translation.
    LastWriteWins,
    /// Transform incoming operations against unobserved committed ones.
    OperationalTransform,
    /// Queue overlapping operations for explicit human resolution.
    Manual,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

/// Per-session settings, fixed at creation except through `manageSettings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub max_participants: usize,
    pub allow_guests: bool,
    pub auto_save: bool,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_participants: 10,
            allow_guests: true,
            auto_save: true,
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_participants < 1 || self.max_participants > MAX_PARTICIPANT_LIMIT {
            return Err(EngineError::InvalidOperation(format!(
                "maxParticipants must be between 1 and {}",
                MAX_PARTICIPANT_LIMIT
            )));
        }
        Ok(())
    }
}

/// Session metadata as exposed over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSession {
    pub id: SessionId,
    pub name: String,
    pub owner_id: UserId,
    pub settings: SessionSettings,
    pub is_active: bool,
    pub created_at: i64,
    pub last_activity: i64,
}

impl CollaborationSession {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>, settings: SessionSettings) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: owner_id.into(),
            settings,
            is_active: true,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Why a session was closed; delivered with the close notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    Closed,
    IdleTimeout,
    Superseded,
}

/// Full view of a session handed to a participant on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: CollaborationSession,
    pub participants: Vec<Participant>,
    pub cursors: Vec<CursorState>,
}
