//! Worker callbacks that drive a task through its lifecycle

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::models::*;
use crate::AppState;

use super::ApiError;

/// POST /api/tasks/:task_id/start
pub async fn start_task(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.tracker.mark_processing(&task_id, &req.worker_id).await?;
    Ok(Json(task.into()))
}

/// POST /api/tasks/:task_id/steps
pub async fn advance_step(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<AdvanceStepRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.tracker.advance_step(&task_id, &req.step, req.progress).await?;
    Ok(Json(task.into()))
}

/// POST /api/tasks/:task_id/complete
pub async fn complete_task(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.tracker.complete(&task_id).await?;
    Ok(Json(task.into()))
}

/// POST /api/tasks/:task_id/fail
pub async fn fail_task(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(req): Json<FailTaskRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.tracker.fail(&task_id, &req.error_message).await?;
    Ok(Json(task.into()))
}
