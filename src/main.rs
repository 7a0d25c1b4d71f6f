//! Collaborative session engine server.
//!
//! HTTP carries session administration (create, list, close, seed contexts)
//! and read-only views; the WebSocket gateway at `/ws` carries the live
//! collaboration protocol.

mod auth;
mod comments;
mod engine;
mod error;
mod gateway;
mod presence;
mod protocol;
mod session;
mod storage;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use auth::TokenAuth;
use comments::CommentStore;
use error::{EngineError, ErrorCode};
use session::{CloseReason, EngineConfig, Role, SessionRegistry, SessionSettings};
use storage::{ContextStore, SledStore, StorageConfig};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub comments: Arc<CommentStore>,
    pub auth: Arc<TokenAuth>,
    pub store: Arc<SledStore>,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collab_engine=debug,info")),
        )
        .init();

    let config = EngineConfig::from_env();
    let port = config.port;

    let store = Arc::new(SledStore::open(StorageConfig::new(&config.storage_path))?);
    let context_store: Arc<dyn ContextStore> = store.clone();
    let registry = Arc::new(SessionRegistry::new(config, context_store));
    let state = AppState {
        registry: registry.clone(),
        comments: Arc::new(CommentStore::new(store.clone())),
        auth: Arc::new(TokenAuth::from_env()),
        store,
        started_at: Instant::now(),
    };

    let flush_store = state.store.clone();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    registry.start_background_tasks(&shutdown_tx);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/tokens", post(issue_token))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id", get(get_session).delete(close_session))
        .route("/api/sessions/:id/join", post(join_session))
        .route("/api/sessions/:id/leave", post(leave_session))
        .route("/api/sessions/:id/role", post(set_role))
        .route("/api/sessions/:id/cursors", get(session_cursors).post(update_cursor))
        .route("/api/sessions/:id/typing", get(session_typing))
        .route("/api/contexts/:id", put(seed_context).get(get_context))
        .route("/api/contexts/:id/comments", get(context_comments))
        .route("/ws", get(gateway::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("collaborative session engine listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutting down");
            let _ = shutdown_tx.send(());
        })
        .await?;

    flush_store.flush()?;
    Ok(())
}

/// Map an engine error to the HTTP layer.
fn error_response(err: EngineError) -> Response {
    let code = err.code();
    let status = match code {
        ErrorCode::SessionNotFound | ErrorCode::ContextNotFound | ErrorCode::ParticipantNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::SessionInactive => StatusCode::GONE,
        ErrorCode::CapacityExceeded | ErrorCode::GuestsNotAllowed | ErrorCode::ConflictDetected => {
            StatusCode::CONFLICT
        }
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::BadHandshake => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidOperation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::StorageError | ErrorCode::ConnectionError => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "code": code, "message": err.to_string() }))).into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "sessions": state.registry.session_count(),
        "activeSessions": state.registry.active_session_count(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueTokenRequest {
    user_id: String,
}

/// Issue a gateway token for a user id. In deployments with an external
/// identity provider this endpoint is disabled and tokens come from there.
async fn issue_token(State(state): State<AppState>, Json(req): Json<IssueTokenRequest>) -> Response {
    let token = state.auth.issue(&req.user_id);
    Json(json!({ "userId": req.user_id, "token": token })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    name: String,
    user_id: String,
    display_name: String,
    #[serde(default)]
    settings: Option<SessionSettings>,
}

async fn create_session(State(state): State<AppState>, Json(req): Json<CreateSessionRequest>) -> Response {
    let settings = req.settings.unwrap_or_default();
    match state
        .registry
        .create_session(&req.name, &req.user_id, &req.display_name, settings)
    {
        Ok((session, owner)) => (
            StatusCode::CREATED,
            Json(json!({ "session": session, "owner": owner })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ListSessionsQuery {
    user: String,
}

async fn list_sessions(State(state): State<AppState>, Query(query): Query<ListSessionsQuery>) -> Response {
    Json(json!({ "sessions": state.registry.list_for_user(&query.user) })).into_response()
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Ok(session) => Json(session.snapshot()).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ActorQuery {
    user: String,
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ActorQuery>,
) -> Response {
    match state
        .registry
        .close_session(&id, Some(&query.user), CloseReason::Closed)
    {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    user_id: String,
    display_name: String,
    #[serde(default)]
    role: Option<Role>,
}

/// Join over HTTP, for clients that want a roster seat before (or without)
/// opening a gateway connection.
async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> Response {
    match state
        .registry
        .join(&id, &req.user_id, &req.display_name, req.role.unwrap_or_default())
    {
        Ok((_, participant)) => (StatusCode::CREATED, Json(participant)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetRoleRequest {
    user_id: String,
    target_user_id: String,
    role: Role,
}

async fn set_role(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetRoleRequest>,
) -> Response {
    match state
        .registry
        .set_role(&id, &req.user_id, &req.target_user_id, req.role)
    {
        Ok(participant) => Json(participant).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRequest {
    user_id: String,
}

async fn leave_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<LeaveRequest>,
) -> Response {
    match state.registry.leave(&id, &req.user_id) {
        Ok(Some(participant)) => Json(participant).into_response(),
        Ok(None) => error_response(EngineError::ParticipantNotFound(req.user_id)),
        Err(e) => error_response(e),
    }
}

async fn session_cursors(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Ok(session) => Json(json!({ "cursors": session.presence.cursors() })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCursorRequest {
    participant_id: String,
    #[serde(default)]
    context_id: Option<String>,
    #[serde(default)]
    position: Option<usize>,
    #[serde(default)]
    selection: Option<presence::Selection>,
}

async fn update_cursor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateCursorRequest>,
) -> Response {
    match state.registry.update_cursor(
        &id,
        &req.participant_id,
        req.context_id,
        req.position,
        req.selection,
    ) {
        Ok(cursor) => Json(cursor).into_response(),
        Err(e) => error_response(e),
    }
}

async fn session_typing(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Ok(session) => Json(json!({ "typing": session.presence.typing() })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SeedContextRequest {
    content: String,
}

/// Create or overwrite a context document. Contexts must exist before the
/// sequencer will accept operations against them.
async fn seed_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SeedContextRequest>,
) -> Response {
    match state.store.set_document(&id, &req.content).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()),
    }
}

async fn get_context(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_document(&id).await {
        Ok(Some(content)) => Json(json!({ "contextId": id, "content": content })).into_response(),
        Ok(None) => error_response(EngineError::ContextNotFound(id)),
        Err(e) => error_response(e.into()),
    }
}

async fn context_comments(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.comments.comments_for_context(&id) {
        Ok(comments) => Json(json!({ "comments": comments })).into_response(),
        Err(e) => error_response(e),
    }
}
