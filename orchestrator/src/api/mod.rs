//! HTTP API
//!
//! Execution outcomes, failed or not, are returned with 200. Requests that
//! are rejected before anything runs carry a matching 4xx/5xx status.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared_types::{ErrorCode, SessionRef, TaskError, TaskRequest, WorkflowRequest};
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::bridge;
use crate::error::SandboxError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/execute", post(execute_task))
        .route("/workflows/execute", post(execute_workflow))
        .route("/sessions/stats", get(session_stats))
        .route("/sessions/restart", post(restart_session))
        .route("/sessions/cleanup", post(cleanup_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(error: Option<&TaskError>, ran: bool) -> StatusCode {
    match error.map(|e| e.code) {
        Some(code) if code.is_request_level() => match code {
            ErrorCode::TaskLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::SessionLimitExceeded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        },
        Some(ErrorCode::InternalError) if !ran => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

fn error_response(err: &SandboxError) -> axum::response::Response {
    let info = bridge::error_info(err);
    let status = status_for(Some(&info), false);
    (
        status,
        Json(json!({
            "success": false,
            "error": info,
        })),
    )
        .into_response()
}

fn malformed_body(rejection: JsonRejection) -> axum::response::Response {
    error_response(&SandboxError::InvalidRequest(rejection.body_text()))
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /tasks/execute
async fn execute_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed_body(rejection),
    };

    let response = state.execute_task(&req).await;
    let status = status_for(response.error.as_ref(), !response.task_id.is_empty());
    (status, Json(response)).into_response()
}

/// POST /workflows/execute
async fn execute_workflow(
    State(state): State<AppState>,
    payload: Result<Json<WorkflowRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed_body(rejection),
    };

    let response = state.execute_workflow(&req).await;
    // A workflow turned away at its first step answers like a single task.
    let status = match response.steps.as_slice() {
        [] => status_for(response.error.as_ref(), false),
        [only] => match only.error.as_ref() {
            Some(err) if err.code.is_request_level() => status_for(Some(err), true),
            _ => StatusCode::OK,
        },
        _ => StatusCode::OK,
    };
    (status, Json(response)).into_response()
}

/// GET /sessions/stats
async fn session_stats(State(state): State<AppState>) -> axum::response::Response {
    match state.session_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(&err),
    }
}

/// POST /sessions/restart
async fn restart_session(
    State(state): State<AppState>,
    payload: Result<Json<SessionRef>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed_body(rejection),
    };

    match state.restart_session(&req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

/// POST /sessions/cleanup
async fn cleanup_session(
    State(state): State<AppState>,
    payload: Result<Json<SessionRef>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return malformed_body(rejection),
    };

    match state.cleanup_session(&req).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}
