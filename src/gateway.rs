//! WebSocket gateway.
//!
//! Each connection moves through a strict lifecycle: the HTTP upgrade is
//! validated first (session, user, and token query parameters), then the
//! first frame must be a `join`, and only then does the connection become a
//! live participant wired into the session's event bus. A participant holds
//! at most one live connection; a newer one supersedes the older, which is
//! told why and closed.
//!
//! Outbound delivery never blocks the engine. Each connection has a bounded
//! direct queue (overflow disconnects the slow client) and a subscription to
//! the session bus (overflow drops the oldest broadcasts).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use crate::auth::AuthVerifier;
use crate::error::{EngineError, ErrorCode};
use crate::protocol::{ClientMessage, ServerMessage, SessionEvent};
use crate::session::{CloseReason, Participant, SessionState, UserId};
use crate::AppState;

/// Lifecycle of a gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Joined,
    Closing,
    Closed,
}

/// Sender half of a live connection, registered per participant.
///
/// Cloneable so the registry can reach a connection to close it when the
/// session ends or the participant reconnects elsewhere.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub user_id: UserId,
    tx: mpsc::Sender<ServerMessage>,
    closer: Arc<Notify>,
}

impl ConnectionHandle {
    pub(crate) fn new(user_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tx,
            closer: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Queue a direct message. A full queue means the client cannot keep up
    /// with messages addressed specifically to it, so the connection is
    /// marked for close rather than blocking the engine.
    pub fn send(&self, message: ServerMessage) -> Result<(), EngineError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.connection_id, "outbound queue full, disconnecting");
                self.close();
                Err(EngineError::Connection("outbound queue full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::Connection("connection closed".to_string()))
            }
        }
    }

    /// Ask the connection's writer task to shut down. Stores a permit, so a
    /// close requested before the writer is waiting still takes effect.
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

/// Required query parameters on the upgrade request
#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

fn handshake_error(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "code": code, "message": message.into() })),
    )
        .into_response()
}

/// `GET /ws?session=..&user=..&token=..`
///
/// Handshake failures are rejected before the upgrade so clients get a
/// proper HTTP status instead of a socket that closes immediately.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<AppState>,
) -> Response {
    let (session_id, user_id, token) = match (params.session, params.user, params.token) {
        (Some(s), Some(u), Some(t)) => (s, u, t),
        _ => {
            let err = EngineError::BadHandshake(
                "session, user, and token query parameters are required".to_string(),
            );
            return handshake_error(StatusCode::BAD_REQUEST, err.code(), err.to_string());
        }
    };

    match state.auth.verify(&token) {
        Some(verified) if verified == user_id => {}
        _ => {
            let err = EngineError::BadHandshake("token verification failed".to_string());
            return handshake_error(StatusCode::UNAUTHORIZED, err.code(), err.to_string());
        }
    }

    let session = match state.registry.get(&session_id) {
        Ok(s) => s,
        Err(e) => return handshake_error(StatusCode::NOT_FOUND, e.code(), e.to_string()),
    };
    if !session.is_active() {
        return handshake_error(
            StatusCode::GONE,
            ErrorCode::SessionInactive,
            "session is no longer active",
        );
    }

    debug!(session = %session_id, user = %user_id, phase = ?ConnectionPhase::Connecting, "handshake accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, state, session_id, user_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, session_id: String, user_id: String) {
    debug!(session = %session_id, user = %user_id, phase = ?ConnectionPhase::Authenticating, "upgraded");
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first frame must be a join; anything else is a protocol error.
    let (display_name, role) = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Join { display_name, role }) => break (display_name, role),
                _ => {
                    send_direct(
                        &mut ws_tx,
                        ServerMessage::Error {
                            code: ErrorCode::BadHandshake,
                            message: "expected a join message".to_string(),
                        },
                    )
                    .await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let (session, participant) = match state.registry.join(
        &session_id,
        &user_id,
        &display_name,
        role.unwrap_or_default(),
    ) {
        Ok(joined) => joined,
        Err(e) => {
            send_direct(
                &mut ws_tx,
                ServerMessage::Error {
                    code: e.code(),
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let (handle, direct_rx) = ConnectionHandle::new(&user_id, state.registry.config().outbound_capacity);
    let connection_id = handle.connection_id.clone();

    // Subscribe before registering so no event between the two is missed.
    let events = session.subscribe();

    // One live connection per participant: a reconnect supersedes the old
    // connection, which is told why before being closed.
    if let Some(old) = session.connections.insert(participant.id.clone(), handle.clone()) {
        // The close frame itself ends the old writer; a hard close here
        // could race it and drop the socket before the reason is sent.
        let send_failed = old
            .send(ServerMessage::SessionClosed {
                session_id: session_id.clone(),
                reason: CloseReason::Superseded,
            })
            .is_err();
        if send_failed {
            old.close();
        }
    }

    send_direct(
        &mut ws_tx,
        ServerMessage::Joined {
            participant: participant.clone(),
            session: session.snapshot(),
        },
    )
    .await;

    info!(
        session = %session_id,
        participant = %participant.id,
        connection = %connection_id,
        phase = ?ConnectionPhase::Joined,
        "connection joined"
    );

    let writer = tokio::spawn(write_loop(
        ws_tx,
        direct_rx,
        events,
        handle.closer.clone(),
        participant.id.clone(),
    ));

    // Reader loop: route frames until the client leaves or the socket drops.
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                let _ = handle.send(ServerMessage::Error {
                    code: ErrorCode::InvalidOperation,
                    message: format!("malformed frame: {}", e),
                });
                continue;
            }
        };

        if matches!(message, ClientMessage::Leave) {
            debug!(connection = %connection_id, phase = ?ConnectionPhase::Closing, "client leaving");
            break;
        }

        if let Err(e) = route_message(&state, &session, &session_id, &participant, &handle, message).await {
            // Rejections are per-request; the connection stays up.
            let _ = handle.send(ServerMessage::Error {
                code: e.code(),
                message: e.to_string(),
            });
        }
    }

    debug!(connection = %connection_id, phase = ?ConnectionPhase::Closed, "connection closed");

    handle.close();
    let _ = writer.await;

    // Only unregister if this is still the live connection; a superseding
    // connection must not be torn down by its predecessor's cleanup.
    let still_live = session
        .connections
        .get(&participant.id)
        .map(|h| h.connection_id == connection_id)
        .unwrap_or(false);
    if still_live {
        session.connections.remove(&participant.id);
        session.presence.clear_participant(&participant.id);
        let _ = state.registry.leave(&session_id, &user_id);
    }
}

/// Owns the socket's sink: drains the direct queue and the session bus.
async fn write_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut direct_rx: mpsc::Receiver<ServerMessage>,
    mut events: broadcast::Receiver<SessionEvent>,
    closer: Arc<Notify>,
    participant_id: String,
) {
    loop {
        tokio::select! {
            direct = direct_rx.recv() => {
                let Some(message) = direct else { break };
                let done = matches!(message, ServerMessage::SessionClosed { .. });
                if !send_direct(&mut ws_tx, message).await || done {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        // The actor already got a direct reply; don't echo
                        // their own broadcast back at them.
                        if event.origin.as_deref() == Some(participant_id.as_str()) {
                            continue;
                        }
                        let done = matches!(event.message, ServerMessage::SessionClosed { .. });
                        if !send_direct(&mut ws_tx, event.message).await || done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Oldest broadcasts are dropped for slow readers;
                        // presence repaints itself and edits resync on the
                        // next snapshot fetch.
                        warn!(participant = %participant_id, skipped, "event bus lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = closer.notified() => break,
        }
    }
    let _ = ws_tx.close().await;
}

async fn send_direct(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: ServerMessage,
) -> bool {
    match serde_json::to_string(&message) {
        Ok(text) => ws_tx.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("failed to encode frame: {}", e);
            true
        }
    }
}

/// Dispatch one client frame. Errors abort only this frame.
async fn route_message(
    state: &AppState,
    session: &Arc<SessionState>,
    session_id: &str,
    participant: &Participant,
    handle: &ConnectionHandle,
    message: ClientMessage,
) -> Result<(), EngineError> {
    use crate::engine::SubmitOutcome;
    use crate::session::Permission;

    match message {
        ClientMessage::Join { .. } => {
            // Already joined; a second join on the same socket is a no-op.
            Ok(())
        }

        ClientMessage::Operation { context_id, op } => {
            let outcome = state
                .registry
                .submit_operation(session_id, &participant.id, &context_id, op)
                .await?;
            match outcome {
                SubmitOutcome::Committed(operation) => {
                    handle.send(ServerMessage::OperationAck {
                        context_id,
                        sequence_number: operation.sequence_number,
                    })?;
                }
                SubmitOutcome::Conflict(conflict) => {
                    handle.send(ServerMessage::ConflictDetected { conflict })?;
                }
            }
            Ok(())
        }

        ClientMessage::Cursor {
            context_id,
            position,
            selection,
        } => {
            state
                .registry
                .update_cursor(session_id, &participant.id, context_id, position, selection)?;
            Ok(())
        }

        ClientMessage::Typing { context_id } => {
            state.registry.mark_typing(session_id, &participant.id, &context_id)
        }

        ClientMessage::Comment {
            context_id,
            content,
            position,
            mentions,
        } => {
            session.roster.require(&participant.id, Permission::Comment)?;
            let comment = state
                .comments
                .add_comment(&context_id, &participant.id, &content, position, mentions)?;
            session.touch();

            for mentioned in &comment.mentions {
                session.broadcast(SessionEvent::system(ServerMessage::MentionNotification {
                    comment_id: comment.id.clone(),
                    context_id: comment.context_id.clone(),
                    author_id: participant.id.clone(),
                    mentioned: mentioned.clone(),
                }));
            }
            session.broadcast(SessionEvent::from_participant(
                participant.id.clone(),
                ServerMessage::CommentAdded {
                    comment: comment.clone(),
                },
            ));
            handle.send(ServerMessage::CommentAdded { comment })?;
            Ok(())
        }

        ClientMessage::ResolveComment { comment_id } => {
            session.roster.require(&participant.id, Permission::Comment)?;
            let comment = state.comments.resolve(&comment_id)?;
            session.broadcast(SessionEvent::from_participant(
                participant.id.clone(),
                ServerMessage::CommentUpdated {
                    comment: comment.clone(),
                },
            ));
            handle.send(ServerMessage::CommentUpdated { comment })?;
            Ok(())
        }

        ClientMessage::ReopenComment { comment_id } => {
            session.roster.require(&participant.id, Permission::Comment)?;
            let comment = state.comments.reopen(&comment_id)?;
            session.broadcast(SessionEvent::from_participant(
                participant.id.clone(),
                ServerMessage::CommentUpdated {
                    comment: comment.clone(),
                },
            ));
            handle.send(ServerMessage::CommentUpdated { comment })?;
            Ok(())
        }

        ClientMessage::AddReaction { comment_id, emoji } => {
            session.roster.require(&participant.id, Permission::Comment)?;
            let comment = state.comments.add_reaction(&comment_id, &participant.id, &emoji)?;
            session.broadcast(SessionEvent::from_participant(
                participant.id.clone(),
                ServerMessage::CommentUpdated {
                    comment: comment.clone(),
                },
            ));
            handle.send(ServerMessage::CommentUpdated { comment })?;
            Ok(())
        }

        ClientMessage::ResolveConflict {
            context_id,
            conflict_id,
            action,
            merged,
        } => {
            state
                .registry
                .resolve_conflict(session_id, &participant.id, &context_id, &conflict_id, action, merged)
                .await?;
            Ok(())
        }

        ClientMessage::Leave => Ok(()),

        ClientMessage::Ping { timestamp } => handle.send(ServerMessage::Pong {
            timestamp,
            server_time: chrono::Utc::now().timestamp_millis(),
        }),
    }
}
