//! Wire protocol for the collaboration gateway.
//!
//! All frames are JSON text messages tagged by `type`. Client frames are
//! requests or fire-and-forget notifications; server frames are acks,
//! broadcasts, and errors. The same `ServerMessage` type also rides the
//! in-process event bus, wrapped in a `SessionEvent` that records which
//! participant caused it so connections can skip echoing a sender's own
//! broadcasts back to them.

use serde::{Deserialize, Serialize};

use crate::comments::Comment;
use crate::engine::{ConflictAction, ConflictNotice, OperationInput, SequencedOperation};
use crate::error::ErrorCode;
use crate::presence::{CursorState, Selection, TypingIndicator};
use crate::session::{CloseReason, ContextId, Participant, ParticipantId, Role, SessionId, SessionSnapshot, UserId};

/// Frames sent by clients over the WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// First frame after the upgrade; anything else is a protocol error.
    #[serde(rename_all = "camelCase")]
    Join {
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },

    /// Submit an edit against a context
    #[serde(rename_all = "camelCase")]
    Operation {
        context_id: ContextId,
        #[serde(flatten)]
        op: OperationInput,
    },

    /// Cursor moved or selection changed
    #[serde(rename_all = "camelCase")]
    Cursor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_id: Option<ContextId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },

    /// Participant is typing in a context
    #[serde(rename_all = "camelCase")]
    Typing { context_id: ContextId },

    /// Attach a comment to a context position
    #[serde(rename_all = "camelCase")]
    Comment {
        context_id: ContextId,
        content: String,
        position: usize,
        #[serde(default)]
        mentions: Vec<UserId>,
    },

    #[serde(rename_all = "camelCase")]
    ResolveComment { comment_id: String },

    #[serde(rename_all = "camelCase")]
    ReopenComment { comment_id: String },

    #[serde(rename_all = "camelCase")]
    AddReaction { comment_id: String, emoji: String },

    /// Settle a queued conflict (manual resolution mode)
    #[serde(rename_all = "camelCase")]
    ResolveConflict {
        context_id: ContextId,
        conflict_id: String,
        action: ConflictAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merged: Option<OperationInput>,
    },

    /// Graceful departure; the participant record stays in the roster.
    Leave,

    Ping { timestamp: i64 },
}

/// Frames sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Reply to a successful join: who you are plus current session state
    #[serde(rename_all = "camelCase")]
    Joined {
        participant: Participant,
        session: SessionSnapshot,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: Participant },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        participant_id: ParticipantId,
        user_id: UserId,
    },

    /// A participant's role (and therefore permissions) changed
    #[serde(rename_all = "camelCase")]
    RoleChanged { participant: Participant },

    /// Direct ack to the submitter of a committed operation
    #[serde(rename_all = "camelCase")]
    OperationAck {
        context_id: ContextId,
        sequence_number: u64,
    },

    /// A committed operation, broadcast to everyone except the submitter
    #[serde(rename_all = "camelCase")]
    OperationCommitted { operation: SequencedOperation },

    /// Manual-mode conflict: the operation is queued, not applied
    #[serde(rename_all = "camelCase")]
    ConflictDetected { conflict: ConflictNotice },

    /// A queued conflict was settled
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        context_id: ContextId,
        applied: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    CursorBroadcast { cursor: CursorState },

    #[serde(rename_all = "camelCase")]
    TypingBroadcast { typing: TypingIndicator },

    #[serde(rename_all = "camelCase")]
    CommentAdded { comment: Comment },

    /// Resolution, reopen, or reaction changed an existing comment
    #[serde(rename_all = "camelCase")]
    CommentUpdated { comment: Comment },

    /// A comment mentioned this user
    #[serde(rename_all = "camelCase")]
    MentionNotification {
        comment_id: String,
        context_id: ContextId,
        author_id: ParticipantId,
        mentioned: UserId,
    },

    #[serde(rename_all = "camelCase")]
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },

    #[serde(rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },

    #[serde(rename_all = "camelCase")]
    Pong { timestamp: i64, server_time: i64 },
}

/// An event on a session's broadcast bus.
///
/// `origin` names the participant whose action produced the event, when
/// there is one. Connections drop events whose origin is themselves;
/// the actor that caused a change already got a direct reply.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub origin: Option<ParticipantId>,
    pub message: ServerMessage,
}

impl SessionEvent {
    pub fn from_participant(origin: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            origin: Some(origin.into()),
            message,
        }
    }

    pub fn system(message: ServerMessage) -> Self {
        Self {
            origin: None,
            message,
        }
    }
}
