//! Session arena and lifecycle management.
//!
//! The registry owns every live session. Each session bundles its metadata,
//! roster, presence tracker, sequencer, and broadcast bus into one
//! [`SessionState`]; the registry routes authorized calls to the right one
//! and runs the background sweeps (idle close, presence expiry, document
//! flush).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    CloseReason, CollaborationSession, ContextId, MAX_SESSION_NAME_LEN, Participant,
    ParticipantRoster, Permission, Role, SessionId, SessionSettings, SessionSnapshot,
};
use crate::engine::{ConflictAction, OperationInput, ResolveOutcome, Sequencer, SubmitOutcome};
use crate::error::{EngineError, EngineResult};
use crate::gateway::ConnectionHandle;
use crate::presence::{CursorState, PresenceConfig, PresenceTracker, Selection, TypingIndicator};
use crate::protocol::{ServerMessage, SessionEvent};
use crate::storage::ContextStore;

/// Engine-wide tunables, loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub storage_path: String,
    /// Sessions with no activity for this long are closed.
    pub idle_timeout: Duration,
    /// How often the idle/presence sweep runs.
    pub sweep_interval: Duration,
    /// How often dirty documents are flushed when auto-save is off.
    pub flush_interval: Duration,
    pub presence: PresenceConfig,
    /// Capacity of each session's broadcast bus.
    pub event_capacity: usize,
    /// Capacity of each connection's direct outbound queue.
    pub outbound_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage_path: "./data/engine.sled".to_string(),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(15),
            presence: PresenceConfig::default(),
            event_capacity: 256,
            outbound_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            config.storage_path = path;
        }
        if let Some(secs) = std::env::var("SESSION_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Everything belonging to one live session.
pub struct SessionState {
    pub meta: RwLock<CollaborationSession>,
    pub roster: ParticipantRoster,
    pub presence: PresenceTracker,
    pub sequencer: Sequencer,
    events: broadcast::Sender<SessionEvent>,
    /// One live gateway connection per participant.
    pub connections: DashMap<String, ConnectionHandle>,
    last_activity: RwLock<Instant>,
}

impl SessionState {
    fn new(
        session: CollaborationSession,
        store: Arc<dyn ContextStore>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let sequencer = Sequencer::new(&session.id, &session.settings, store, events.clone());
        Self {
            roster: ParticipantRoster::new(&session.id),
            presence: PresenceTracker::new(&session.id, config.presence),
            sequencer,
            events,
            connections: DashMap::new(),
            last_activity: RwLock::new(Instant::now()),
            meta: RwLock::new(session),
        }
    }

    pub fn id(&self) -> SessionId {
        self.meta.read().id.clone()
    }

    pub fn is_active(&self) -> bool {
        self.meta.read().is_active
    }

    pub fn settings(&self) -> SessionSettings {
        self.meta.read().settings.clone()
    }

    /// Record activity; idle close is measured from the last touch.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
        self.meta.write().last_activity = chrono::Utc::now().timestamp();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Subscribe to the session's event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish on the event bus. A send error just means nobody is
    /// connected right now.
    pub fn broadcast(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.meta.read().clone(),
            participants: self.roster.members(),
            cursors: self.presence.cursors(),
        }
    }

    fn require_active(&self) -> EngineResult<()> {
        if !self.is_active() {
            return Err(EngineError::SessionInactive(self.id()));
        }
        Ok(())
    }
}

/// Owner of all live sessions.
pub struct SessionRegistry {
    config: EngineConfig,
    sessions: DashMap<SessionId, Arc<SessionState>>,
    store: Arc<dyn ContextStore>,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig, store: Arc<dyn ContextStore>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a session. The creator becomes its owner and is joined
    /// immediately, so the owner's seat counts against capacity from the
    /// start.
    pub fn create_session(
        &self,
        name: &str,
        owner_user_id: &str,
        owner_display_name: &str,
        settings: SessionSettings,
    ) -> EngineResult<(CollaborationSession, Participant)> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_SESSION_NAME_LEN {
            return Err(EngineError::InvalidOperation(format!(
                "session name must be 1-{} characters",
                MAX_SESSION_NAME_LEN
            )));
        }
        settings.validate()?;

        let session = CollaborationSession::new(name, owner_user_id, settings.clone());
        let state = Arc::new(SessionState::new(session.clone(), self.store.clone(), &self.config));

        let owner = state
            .roster
            .join(owner_user_id, owner_display_name, Role::Owner, &settings)?;

        info!(session = %session.id, owner = %owner_user_id, "session created");
        self.sessions.insert(session.id.clone(), state);
        Ok((session, owner))
    }

    pub fn get(&self, session_id: &str) -> EngineResult<Arc<SessionState>> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Sessions a user belongs to, active first, newest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<CollaborationSession> {
        let mut sessions: Vec<CollaborationSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.roster.contains_user(user_id))
            .map(|entry| entry.meta.read().clone())
            .collect();
        sessions.sort_by(|a, b| b.is_active.cmp(&a.is_active).then(b.created_at.cmp(&a.created_at)));
        sessions
    }

    /// Join a user to an active session and announce them.
    pub fn join(
        &self,
        session_id: &str,
        user_id: &str,
        display_name: &str,
        role: Role,
    ) -> EngineResult<(Arc<SessionState>, Participant)> {
        let state = self.get(session_id)?;
        state.require_active()?;

        let settings = state.settings();
        let participant = state.roster.join(user_id, display_name, role, &settings)?;
        state.touch();

        state.broadcast(SessionEvent::from_participant(
            participant.id.clone(),
            ServerMessage::ParticipantJoined {
                participant: participant.clone(),
            },
        ));

        debug!(session = %session_id, user = %user_id, "participant joined");
        Ok((state, participant))
    }

    /// Mark a participant offline and announce the departure. Their record
    /// stays in the roster so history remains attributed.
    pub fn leave(&self, session_id: &str, user_id: &str) -> EngineResult<Option<Participant>> {
        let state = self.get(session_id)?;
        let left = state.roster.leave(user_id);

        if let Some(participant) = &left {
            state.presence.clear_participant(&participant.id);
            state.broadcast(SessionEvent::from_participant(
                participant.id.clone(),
                ServerMessage::ParticipantLeft {
                    participant_id: participant.id.clone(),
                    user_id: participant.user_id.clone(),
                },
            ));
            state.touch();
        }
        Ok(left)
    }

    /// Close a session: reject new work, flush documents, notify and
    /// disconnect everyone. The session stays retrievable but inactive.
    pub fn close_session(&self, session_id: &str, actor_user_id: Option<&str>, reason: CloseReason) -> EngineResult<CollaborationSession> {
        let state = self.get(session_id)?;

        if let Some(actor) = actor_user_id {
            let participant = state
                .roster
                .get_by_user(actor)
                .ok_or_else(|| EngineError::ParticipantNotFound(actor.to_string()))?;
            if !participant.role.grants(Permission::ManageSettings) {
                return Err(EngineError::Forbidden(Permission::ManageSettings.to_string()));
            }
        }

        {
            let mut meta = state.meta.write();
            if !meta.is_active {
                return Ok(meta.clone());
            }
            meta.is_active = false;
        }

        state.sequencer.flush_all();
        state.sequencer.shutdown();
        state.presence.clear();

        let notice = ServerMessage::SessionClosed {
            session_id: session_id.to_string(),
            reason,
        };
        state.broadcast(SessionEvent::system(notice.clone()));

        // Queue the close frame on each connection's direct channel; the
        // writer sends it and then shuts itself down, so the reason reaches
        // the client before the socket drops. Only an unreachable queue
        // gets a hard close.
        for entry in state.connections.iter() {
            if entry.value().send(notice.clone()).is_err() {
                entry.value().close();
            }
        }
        state.connections.clear();

        info!(session = %session_id, ?reason, "session closed");
        let meta = state.meta.read().clone();
        Ok(meta)
    }

    /// Authorize and sequence an edit operation.
    pub async fn submit_operation(
        &self,
        session_id: &str,
        participant_id: &str,
        context_id: &str,
        op: OperationInput,
    ) -> EngineResult<SubmitOutcome> {
        let state = self.get(session_id)?;
        state.require_active()?;
        state.roster.require(participant_id, Permission::Edit)?;
        state.touch();

        state.sequencer.submit(participant_id, context_id, op).await
    }

    /// Settle a queued conflict. Whether the resolver may act on someone
    /// else's operation depends on their `manageSettings` permission; the
    /// context worker enforces the author-or-manager rule.
    pub async fn resolve_conflict(
        &self,
        session_id: &str,
        participant_id: &str,
        context_id: &str,
        conflict_id: &str,
        action: ConflictAction,
        merged: Option<OperationInput>,
    ) -> EngineResult<ResolveOutcome> {
        let state = self.get(session_id)?;
        state.require_active()?;
        let resolver = state
            .roster
            .get(participant_id)
            .ok_or_else(|| EngineError::ParticipantNotFound(participant_id.to_string()))?;
        let may_manage = resolver.role.grants(Permission::ManageSettings);
        state.touch();

        state
            .sequencer
            .resolve(context_id, conflict_id, action, merged, participant_id, may_manage)
            .await
    }

    /// Change a participant's role. The roster checks that the acting user
    /// holds `manageSettings`; the new permission set applies immediately.
    pub fn set_role(
        &self,
        session_id: &str,
        acting_user: &str,
        target_user: &str,
        role: Role,
    ) -> EngineResult<Participant> {
        let state = self.get(session_id)?;
        state.require_active()?;

        let updated = state.roster.set_role(acting_user, target_user, role)?;
        state.touch();
        // System-origin so the target's own connection also sees the change.
        state.broadcast(SessionEvent::system(ServerMessage::RoleChanged {
            participant: updated.clone(),
        }));
        Ok(updated)
    }

    /// Record a cursor update and broadcast it to the other participants.
    pub fn update_cursor(
        &self,
        session_id: &str,
        participant_id: &str,
        context_id: Option<ContextId>,
        position: Option<usize>,
        selection: Option<Selection>,
    ) -> EngineResult<CursorState> {
        let state = self.get(session_id)?;
        state.require_active()?;

        let cursor = state
            .presence
            .update_cursor(participant_id, context_id, position, selection);
        state.broadcast(SessionEvent::from_participant(
            participant_id,
            ServerMessage::CursorBroadcast {
                cursor: cursor.clone(),
            },
        ));
        Ok(cursor)
    }

    /// Flag a participant as typing and broadcast the indicator.
    pub fn mark_typing(&self, session_id: &str, participant_id: &str, context_id: &str) -> EngineResult<()> {
        let state = self.get(session_id)?;
        state.require_active()?;

        state.presence.mark_typing(participant_id, context_id);
        state.broadcast(SessionEvent::from_participant(
            participant_id,
            ServerMessage::TypingBroadcast {
                typing: TypingIndicator {
                    participant_id: participant_id.to_string(),
                    context_id: context_id.to_string(),
                },
            },
        ));
        Ok(())
    }

    /// Close idle sessions and expire stale presence.
    pub fn sweep(&self) {
        let mut idle = Vec::new();
        for entry in self.sessions.iter() {
            entry.presence.sweep();
            if entry.is_active() && entry.idle_for() > self.config.idle_timeout {
                idle.push(entry.id());
            }
        }
        for session_id in idle {
            warn!(session = %session_id, "closing idle session");
            if let Err(e) = self.close_session(&session_id, None, CloseReason::IdleTimeout) {
                warn!(session = %session_id, "idle close failed: {}", e);
            }
        }
    }

    /// Ask every sequencer to persist dirty documents.
    pub fn flush_documents(&self) {
        for entry in self.sessions.iter() {
            if entry.is_active() {
                entry.sequencer.flush_all();
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    /// Spawn the periodic sweep and flush loops. Both stop when the
    /// shutdown signal fires.
    pub fn start_background_tasks(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let registry = self.clone();
        let mut stop = shutdown.subscribe();
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.sweep(),
                    _ = stop.recv() => break,
                }
            }
        });

        let registry = self.clone();
        let mut stop = shutdown.subscribe();
        let flush_interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.flush_documents(),
                    _ = stop.recv() => break,
                }
            }
        });
    }
}
