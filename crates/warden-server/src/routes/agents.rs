use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use warden_core::models::{
    AgentIdentity, ConnectionState, ExecutionClass, SessionId, SessionSummary, TaskId,
};

use crate::{error::ApiError, routes::rfc3339, script::enrollment_script, state::AppState};

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub execution_class: String,
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub download_token: String,
    pub execution_class: ExecutionClass,
    pub expires_in_secs: u64,
    pub script: String,
}

#[derive(Debug, Deserialize)]
pub struct BundleRequest {
    pub download_token: String,
}

#[derive(Debug, Serialize)]
pub struct BundleResponse {
    pub agent_identity: AgentIdentity,
    pub session_token: String,
    pub execution_class: ExecutionClass,
    pub heartbeat_interval_ms: u64,
    pub channel_url: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub agent_identity: AgentIdentity,
    pub execution_class: ExecutionClass,
    pub state: ConnectionState,
    pub connected_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub in_flight_task_id: Option<TaskId>,
    pub completed_commands: u64,
}

impl From<SessionSummary> for SessionView {
    fn from(summary: SessionSummary) -> Self {
        Self {
            session_id: summary.session_id,
            agent_identity: summary.agent_identity,
            execution_class: summary.execution_class,
            state: summary.state,
            connected_at: rfc3339(summary.connected_at),
            last_heartbeat_at: rfc3339(summary.last_heartbeat_at),
            in_flight_task_id: summary.in_flight_task_id,
            completed_commands: summary.completed_commands,
        }
    }
}

pub async fn issue_enrollment(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let execution_class: ExecutionClass = request.execution_class.parse().map_err(|_| {
        ApiError::BadRequest(format!(
            "unknown execution_class '{}'",
            request.execution_class
        ))
    })?;
    let grant = state
        .registry
        .issue_download_token(execution_class, request.label)?;

    Ok(Json(EnrollResponse {
        script: enrollment_script(&state.public_url, &grant.download_token),
        download_token: grant.download_token,
        execution_class: grant.execution_class,
        expires_in_secs: grant.expires_in.as_secs(),
    }))
}

pub async fn redeem_bundle(
    State(state): State<AppState>,
    Json(request): Json<BundleRequest>,
) -> Result<Json<BundleResponse>, ApiError> {
    let bundle = state.registry.enroll(&request.download_token).await?;
    Ok(Json(BundleResponse {
        agent_identity: bundle.agent_identity,
        session_token: bundle.session_token,
        execution_class: bundle.execution_class,
        heartbeat_interval_ms: bundle.heartbeat_interval_ms,
        channel_url: state.channel_url.clone(),
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionView>> {
    Json(
        state
            .registry
            .sessions()
            .into_iter()
            .map(SessionView::from)
            .collect(),
    )
}

pub async fn drain_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let summary = state.registry.drain(&SessionId(session_id))?;
    Ok(Json(summary.into()))
}

pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let summary = state.registry.resume(&SessionId(session_id))?;
    Ok(Json(summary.into()))
}

pub fn collaborator_router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_sessions))
        .route("/agents/enroll", post(issue_enrollment))
        .route("/agents/{session_id}/drain", post(drain_session))
        .route("/agents/{session_id}/resume", post(resume_session))
}

/// Routes agents call themselves; they authenticate with their own tokens.
pub fn agent_router() -> Router<AppState> {
    Router::new()
        .route("/agents/bundle", post(redeem_bundle))
        .route("/agents/channel", get(super::channel::open_channel))
}
