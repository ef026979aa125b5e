use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::messaging::PublishOutcome;
use crate::models::*;
use crate::AppState;

use super::{accepted, ApiError};

/// POST /api/provisioning/provision
pub async fn provision_tenant(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionTenantRequest>,
) -> Result<(StatusCode, Json<ProvisionTenantResponse>), ApiError> {
    if req.customer_id.trim().is_empty() {
        return Err(ApiError::bad_request("customerId is required"));
    }
    if req.product_id.trim().is_empty() || req.subscription_plan_id.trim().is_empty() {
        return Err(ApiError::bad_request("productId and subscriptionPlanId are required"));
    }

    let resp = state.coordinator.provision_tenant(&req, auth.subject()).await?;
    Ok(accepted(resp))
}

/// DELETE /api/provisioning/:instance_id
pub async fn deprovision_tenant(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    body: Option<Json<DeprovisionTenantRequest>>,
) -> Result<(StatusCode, Json<AsyncTaskResponse>), ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let resp = state
        .coordinator
        .deprovision_tenant(&instance_id, req.reason.as_deref(), auth.subject())
        .await?;
    Ok(accepted(resp))
}

/// PUT /api/provisioning/:instance_id/features
pub async fn update_tenant_features(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateTenantFeaturesRequest>,
) -> Result<(StatusCode, Json<AsyncTaskResponse>), ApiError> {
    let resp = state
        .coordinator
        .update_tenant_features(&instance_id, &req.features, auth.subject())
        .await?;
    Ok(accepted(resp))
}

/// GET /api/provisioning/tasks/:task_id/status
pub async fn get_task_status(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    Ok(Json(state.tracker.task_status(&task_id).await?))
}

/// POST /api/provisioning/tasks/:task_id/cancel
pub async fn cancel_task(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.tracker.cancel(&task_id).await?;
    Ok(Json(task.into()))
}

/// POST /api/provisioning/tasks/:task_id/republish
pub async fn republish_task(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.tracker.republish(&task_id).await?;
    let delivery = match outcome {
        PublishOutcome::Delivered => "delivered",
        PublishOutcome::Degraded => "pending",
        PublishOutcome::Failed => "failed",
    };
    Ok(Json(serde_json::json!({
        "taskId": task_id,
        "delivery": delivery,
    })))
}

/// GET /api/provisioning/tasks/:task_id/messages
pub async fn list_task_messages(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<OutboxMessage>>, ApiError> {
    Ok(Json(state.tracker.task_messages(&task_id).await?))
}
