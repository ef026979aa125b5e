use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::db::row_helpers::is_unique_violation;
use crate::models::*;
use crate::AppState;

use super::{created, ApiError};

/// GET /api/catalog/features
pub async fn list_catalog_features(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModuleFeatures>>, ApiError> {
    Ok(Json(state.coordinator.feature_catalog().await?))
}

/// POST /api/catalog/products
pub async fn create_product(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(product): Json<Product>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    require_ids(&[&product.id, &product.code])?;
    state.store.create_product(&product).await.map_err(duplicate("product"))?;
    Ok(created(product))
}

/// POST /api/catalog/plans
pub async fn create_plan(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(plan): Json<SubscriptionPlan>,
) -> Result<(StatusCode, Json<SubscriptionPlan>), ApiError> {
    require_ids(&[&plan.id, &plan.code, &plan.product_id])?;
    if state.store.get_product(&plan.product_id).await?.is_none() {
        return Err(ApiError::bad_request(format!("unknown product {}", plan.product_id)));
    }
    state.store.create_plan(&plan).await.map_err(duplicate("plan"))?;
    Ok(created(plan))
}

/// POST /api/catalog/modules
pub async fn create_module(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(module): Json<CatalogModule>,
) -> Result<(StatusCode, Json<CatalogModule>), ApiError> {
    require_ids(&[&module.id, &module.code, &module.product_id])?;
    if state.store.get_product(&module.product_id).await?.is_none() {
        return Err(ApiError::bad_request(format!("unknown product {}", module.product_id)));
    }
    state.store.create_module(&module).await.map_err(duplicate("module"))?;
    Ok(created(module))
}

/// POST /api/catalog/features
pub async fn create_feature(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(feature): Json<FeatureDefinition>,
) -> Result<(StatusCode, Json<FeatureDefinition>), ApiError> {
    require_ids(&[&feature.id, &feature.code, &feature.module_id])?;
    state.store.create_feature(&feature).await.map_err(duplicate("feature"))?;
    Ok(created(feature))
}

fn require_ids(values: &[&String]) -> Result<(), ApiError> {
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(ApiError::bad_request("id, code and parent reference are required"));
    }
    Ok(())
}

fn duplicate(kind: &'static str) -> impl Fn(anyhow::Error) -> ApiError {
    move |e| {
        if is_unique_violation(&e) {
            ApiError::conflict(format!("{} already exists", kind))
        } else {
            e.into()
        }
    }
}
