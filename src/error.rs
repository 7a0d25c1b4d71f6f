//! Engine-wide error taxonomy.
//!
//! Every rejected action maps to a typed error with a stable wire code so
//! clients can reconcile optimistic local state against the server's verdict.
//! Authorization and validation failures abort only the single request that
//! carried them, never the session.

use serde::{Deserialize, Serialize};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the collaborative session engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is no longer active")]
    SessionInactive(String),

    #[error("session is at capacity ({0} participants)")]
    CapacityExceeded(usize),

    #[error("guests are not allowed in this session")]
    GuestsNotAllowed,

    #[error("missing permission: {0}")]
    Forbidden(String),

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("bad handshake: {0}")]
    BadHandshake(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("conflicting edit detected: {0}")]
    ConflictDetected(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("connection error: {0}")]
    Connection(String),
}

impl EngineError {
    /// Stable wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            EngineError::SessionInactive(_) => ErrorCode::SessionInactive,
            EngineError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            EngineError::GuestsNotAllowed => ErrorCode::GuestsNotAllowed,
            EngineError::Forbidden(_) => ErrorCode::Forbidden,
            EngineError::ContextNotFound(_) => ErrorCode::ContextNotFound,
            EngineError::BadHandshake(_) => ErrorCode::BadHandshake,
            EngineError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            EngineError::ConflictDetected(_) => ErrorCode::ConflictDetected,
            EngineError::ParticipantNotFound(_) => ErrorCode::ParticipantNotFound,
            EngineError::Storage(_) => ErrorCode::StorageError,
            EngineError::Connection(_) => ErrorCode::ConnectionError,
        }
    }
}

impl From<crate::storage::StorageError> for EngineError {
    fn from(err: crate::storage::StorageError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Error codes carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    SessionNotFound,
    SessionInactive,
    CapacityExceeded,
    GuestsNotAllowed,
    Forbidden,
    ContextNotFound,
    BadHandshake,
    InvalidOperation,
    ConflictDetected,
    ParticipantNotFound,
    StorageError,
    ConnectionError,
}
