//! The HTTP surface over [`SessionManager`].
//!
//! JSON bodies throughout; errors map onto conventional status codes
//! (404 unknown session/execution, 409 duplicate session, 503 nothing to
//! chat with, 422 rejected agent specs).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use hive_core::session::{ChatOutcome, SessionError, SessionManager, WorkerSpec};
use hive_core::state::IsolationPolicy;

use crate::sse;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub keepalive: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{sid}", get(get_session))
        .route("/api/sessions/{sid}", delete(delete_session))
        .route("/api/sessions/{sid}/worker", post(load_worker))
        .route("/api/sessions/{sid}/worker", delete(unload_worker))
        .route("/api/sessions/{sid}/trigger", post(trigger))
        .route("/api/sessions/{sid}/inject", post(inject))
        .route("/api/sessions/{sid}/chat", post(chat))
        .route("/api/sessions/{sid}/stop", post(stop))
        .route("/api/sessions/{sid}/pause", post(pause))
        .route("/api/sessions/{sid}/resume", post(resume))
        .route("/api/sessions/{sid}/replay", post(replay))
        .route("/api/sessions/{sid}/events", get(sse::events))
        .route("/api/sessions/{sid}/graphs/{gid}/nodes", get(graph_nodes))
        .with_state(state)
}

pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::SessionExists { .. } => StatusCode::CONFLICT,
            SessionError::SessionNotFound { .. }
            | SessionError::ExecutionNotFound { .. }
            | SessionError::GraphNotFound { .. }
            | SessionError::UnknownEntryPoint { .. } => StatusCode::NOT_FOUND,
            SessionError::NoWorker { .. } => StatusCode::BAD_REQUEST,
            SessionError::NoChatTarget => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Checkpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

#[derive(Deserialize)]
struct CreateSessionBody {
    session_id: Option<String>,
    isolation: Option<String>,
}

fn parse_isolation(raw: Option<&str>) -> Option<IsolationPolicy> {
    match raw? {
        "isolated" => Some(IsolationPolicy::Isolated),
        "shared" => Some(IsolationPolicy::Shared),
        "synchronized" => Some(IsolationPolicy::Synchronized),
        _ => None,
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .manager
        .create_session(body.session_id, parse_isolation(body.isolation.as_deref()))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"session_id": session.session_id()})),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    Ok(Json(json!({
        "session_id": session.session_id(),
        "worker_loaded": session.has_worker(),
        "worker_id": session.worker_id(),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.stop_session(&sid).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct LoadWorkerBody {
    worker_id: Option<String>,
}

async fn load_worker(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<LoadWorkerBody>,
) -> Result<Json<Value>, ApiError> {
    // Graph construction is programmatic (template loading is a separate
    // layer); an empty worker still exercises the lifecycle.
    state
        .manager
        .load_worker(
            &sid,
            WorkerSpec {
                worker_id: body.worker_id,
                graphs: Vec::new(),
            },
        )
        .await?;
    let session = state.manager.session(&sid)?;
    Ok(Json(json!({"worker_id": session.worker_id()})))
}

async fn unload_worker(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.manager.unload_worker(&sid).await?;
    Ok(Json(json!({"unloaded": true})))
}

#[derive(Deserialize)]
struct TriggerBody {
    entry_point_id: String,
    #[serde(default)]
    input_data: Value,
}

async fn trigger(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    let execution_id = session.trigger(&body.entry_point_id, body.input_data)?;
    Ok(Json(json!({"execution_id": execution_id})))
}

#[derive(Deserialize)]
struct InjectBody {
    node_id: String,
    content: String,
}

async fn inject(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<InjectBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    let delivered = session.inject(&body.node_id, &body.content)?;
    Ok(Json(json!({"delivered": delivered})))
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
}

async fn chat(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    let outcome = session.chat(&body.message)?;
    let response = match outcome {
        ChatOutcome::Injected { node_id } => {
            json!({"status": "injected", "delivered": true, "node_id": node_id})
        }
        ChatOutcome::Queen => json!({"status": "queen", "delivered": true}),
    };
    Ok(Json(response))
}

#[derive(Deserialize)]
struct ExecutionBody {
    execution_id: String,
}

async fn stop(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ExecutionBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    session.stop(&body.execution_id)?;
    Ok(Json(json!({"stopped": true})))
}

async fn pause(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ExecutionBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    let checkpoint = session.pause(&body.execution_id).await?;
    Ok(Json(json!({
        "paused": true,
        "checkpoint_id": checkpoint.checkpoint_id,
    })))
}

#[derive(Deserialize)]
struct ResumeBody {
    checkpoint_id: Option<String>,
}

async fn resume(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ResumeBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    session.resume(body.checkpoint_id.as_deref()).await?;
    Ok(Json(json!({"resumed": true})))
}

#[derive(Deserialize)]
struct ReplayBody {
    checkpoint_id: String,
}

async fn replay(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<ReplayBody>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    let execution_id = session.replay(&body.checkpoint_id).await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

#[derive(Deserialize)]
pub struct GraphNodesQuery {
    #[allow(dead_code)]
    pub worker_id: Option<String>,
}

async fn graph_nodes(
    State(state): State<AppState>,
    Path((sid, gid)): Path<(String, String)>,
    Query(_query): Query<GraphNodesQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.session(&sid)?;
    Ok(Json(session.graph_progress(&gid)?))
}
