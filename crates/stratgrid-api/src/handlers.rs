//! REST API handlers.
//!
//! Task control writes go through `TaskControl`; every handler answers
//! with the same JSON envelope.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use strat_core::{Credential, DesiredTask, StrategyKind, TaskKey};
use stratgrid_agent::AgentError;
use stratgrid_scheduler::{ExecForward, SchedulerError};
use stratgrid_supervisor::SupervisorError;
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn scheduler_error(e: &SchedulerError) -> axum::response::Response {
    let status = match e {
        SchedulerError::InvalidTask(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NotPlaced(_) => StatusCode::NOT_FOUND,
        SchedulerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SchedulerError::Forward { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "task control request failed");
    }
    error_response(&e.to_string(), status).into_response()
}

// ── Request bodies ─────────────────────────────────────────────

/// POST /api/v1/tasks body.
#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    pub credential: Credential,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// DELETE /api/v1/tasks body.
#[derive(Debug, Deserialize)]
pub struct StopTaskRequest {
    pub credential: Credential,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
}

/// POST /api/v1/tasks/exec body.
#[derive(Debug, Deserialize)]
pub struct ExecTaskRequest {
    pub credential: Credential,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

// ── Task control ───────────────────────────────────────────────

/// POST /api/v1/tasks
pub async fn start_task(
    State(state): State<ApiState>,
    Json(req): Json<StartTaskRequest>,
) -> impl IntoResponse {
    let task = DesiredTask::new(
        req.credential,
        &req.strategy_kind,
        &req.instrument_id,
        &req.endpoint,
        req.params,
    );
    match state.control.start_task(task).await {
        Ok(key) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "task_key": key })),
        )
            .into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// DELETE /api/v1/tasks
pub async fn stop_task(
    State(state): State<ApiState>,
    Json(req): Json<StopTaskRequest>,
) -> impl IntoResponse {
    let key = TaskKey::new(&req.credential.account, &req.strategy_kind, &req.instrument_id);
    match state.control.stop_task(&key).await {
        Ok(true) => ApiResponse::ok(serde_json::json!({ "task_key": key })).into_response(),
        Ok(false) => error_response("task not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /api/v1/tasks/exec
pub async fn exec_task(
    State(state): State<ApiState>,
    Json(req): Json<ExecTaskRequest>,
) -> impl IntoResponse {
    let key = TaskKey::new(&req.credential.account, &req.strategy_kind, &req.instrument_id);
    match state.control.exec(&key, req.params).await {
        Ok(node) => ApiResponse::ok(serde_json::json!({ "task_key": key, "node": node }))
            .into_response(),
        Err(e) => scheduler_error(&e),
    }
}

// ── Listings ───────────────────────────────────────────────────

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>) -> impl IntoResponse {
    match state.control.list_tasks().await {
        Ok(tasks) => ApiResponse::ok(tasks).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// GET /api/v1/placements
pub async fn list_placements(State(state): State<ApiState>) -> impl IntoResponse {
    match state.control.list_placements().await {
        Ok(placements) => ApiResponse::ok(placements).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.control.list_nodes().await {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

// ── Node-internal ──────────────────────────────────────────────

/// POST /internal/v1/tasks/exec
pub async fn internal_exec(
    State(state): State<ApiState>,
    Json(req): Json<ExecForward>,
) -> impl IntoResponse {
    let Some(agent) = &state.agent else {
        return error_response("this node runs no tasks", StatusCode::NOT_FOUND).into_response();
    };
    match agent.exec(&req.task_key, req.params).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "task_key": req.task_key })).into_response(),
        Err(e) => {
            let status = match &e {
                AgentError::NotHere(_) | AgentError::Supervisor(SupervisorError::Closed(_)) => {
                    StatusCode::NOT_FOUND
                }
                AgentError::Supervisor(SupervisorError::NotRunning(_)) => StatusCode::CONFLICT,
                AgentError::Supervisor(SupervisorError::Control(_)) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(&e.to_string(), status).into_response()
        }
    }
}
