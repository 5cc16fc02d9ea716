use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use warden_core::models::{
    CoreError, CoreErrorKind, ExecutionClass, ExecutionTarget, TaskId, TaskPayload, TaskPriority,
    TaskSnapshot, TaskSpec,
};
use warden_core::orchestration::SchedulerStats;
use warden_core::persistence::TaskStore;

use crate::{error::ApiError, routes::rfc3339, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub execution_class: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: TaskPayload,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
}

impl SubmitTaskRequest {
    fn into_spec(self) -> Result<TaskSpec, ApiError> {
        let execution_class: ExecutionClass = self.execution_class.parse().map_err(|_| {
            ApiError::BadRequest(format!(
                "unknown execution_class '{}'",
                self.execution_class
            ))
        })?;
        let priority: TaskPriority = match self.priority.as_deref() {
            None => TaskPriority::Normal,
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("unknown priority '{raw}'")))?,
        };

        let mut spec = TaskSpec::new(execution_class, priority).payload(self.payload);
        if let Some(max_retries) = self.max_retries {
            spec = spec.max_retries(max_retries);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            spec = spec.timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(case_id) = self.case_id {
            spec = spec.case_id(case_id);
        }
        if let Some(investigation_id) = self.investigation_id {
            spec = spec.investigation_id(investigation_id);
        }
        Ok(spec)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub execution_class: ExecutionClass,
    pub priority: TaskPriority,
    pub status: &'static str,
    pub wait_reason: Option<&'static str>,
    pub assigned_to: Option<ExecutionTarget>,
    pub retries: u32,
    pub max_retries: u32,
    pub case_id: Option<String>,
    pub investigation_id: Option<String>,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<TaskSnapshot> for TaskView {
    fn from(snapshot: TaskSnapshot) -> Self {
        Self {
            id: snapshot.id,
            execution_class: snapshot.execution_class,
            priority: snapshot.priority,
            status: snapshot.status.as_str(),
            wait_reason: snapshot.wait_reason.map(|reason| reason.as_str()),
            assigned_to: snapshot.assigned_to,
            retries: snapshot.retries,
            max_retries: snapshot.max_retries,
            case_id: snapshot.case_id,
            investigation_id: snapshot.investigation_id,
            created_at: rfc3339(snapshot.created_at),
            started_at: snapshot.started_at.and_then(rfc3339),
            completed_at: snapshot.completed_at.and_then(rfc3339),
            result: snapshot.result,
            error: snapshot.error,
        }
    }
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<TaskView>), ApiError> {
    let spec = request.into_spec()?;
    let task_id = state.scheduler.submit(spec)?;
    let snapshot = state.scheduler.status(task_id)?;
    tracing::info!(
        task_id = task_id.0,
        class = snapshot.execution_class.as_str(),
        priority = snapshot.priority.as_str(),
        "task submitted"
    );
    Ok((StatusCode::CREATED, Json(TaskView::from(snapshot))))
}

/// Served from memory first, then from the store once the task was pruned.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
) -> Result<Json<TaskView>, ApiError> {
    let task_id = TaskId(task_id);
    match state.scheduler.status(task_id) {
        Ok(snapshot) => Ok(Json(snapshot.into())),
        Err(error) if error.kind == CoreErrorKind::NotFound => {
            let Some(store) = state.task_store.clone() else {
                return Err(error.into());
            };
            match load_persisted(store, task_id).await? {
                Some(snapshot) => Ok(Json(snapshot.into())),
                None => Err(error.into()),
            }
        }
        Err(error) => Err(error.into()),
    }
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.scheduler.cancel(TaskId(task_id))?;
    Ok(Json(json!({ "task_id": task_id, "cancelled": cancelled })))
}

pub async fn task_stats(State(state): State<AppState>) -> Result<Json<SchedulerStats>, ApiError> {
    Ok(Json(state.scheduler.stats()?))
}

async fn load_persisted(
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
) -> Result<Option<TaskSnapshot>, ApiError> {
    tokio::task::spawn_blocking(move || store.get_task(task_id))
        .await
        .map_err(|join_error| {
            ApiError::Core(CoreError::for_task(
                task_id,
                CoreErrorKind::Internal,
                format!("task lookup join failure: {join_error}"),
            ))
        })?
        .map_err(ApiError::from)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
}
