use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::ResolveResponseDto;
use crate::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub organization: Option<String>,
}

/// GET /api/resolve/:code
///
/// Unauthenticated: clients call it before they know which instance to log in to.
pub async fn resolve_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveResponseDto>, ApiError> {
    let dto = state
        .resolver
        .resolve(&code, query.organization.as_deref())
        .await?;
    Ok(Json(dto))
}
