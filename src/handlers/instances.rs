use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::models::*;
use crate::AppState;

use super::ApiError;

/// GET /api/instances/:id/tasks
pub async fn list_instance_tasks(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskStatusResponse>>, ApiError> {
    let tasks = state.tracker.list_instance_tasks(&id).await?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}

/// GET /api/instances/:id/features
pub async fn get_instance_features(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeatureMap>, ApiError> {
    Ok(Json(state.coordinator.stored_features(&id).await?))
}

/// GET /api/instances/:id/entitlements
pub async fn get_instance_entitlements(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeatureMap>, ApiError> {
    Ok(Json(state.coordinator.live_entitlements(&id).await?))
}

/// GET /api/workers/:instance_id/queue
pub async fn get_queue_status(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.tracker.queue_status(&instance_id).await?))
}

/// PATCH /api/instances/:id/status
pub async fn update_instance_status(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateInstanceStatusRequest>,
) -> Result<Json<TenantInstance>, ApiError> {
    let instance = state
        .coordinator
        .set_instance_status(&id, &req.status, auth.subject())
        .await?;
    Ok(Json(instance))
}
