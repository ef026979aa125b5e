//! Customer and subscription records that provisioning validates against

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::db::row_helpers::is_unique_violation;
use crate::models::*;
use crate::provisioning::coordinator::validate_code;
use crate::AppState;

use super::{created, ApiError};

/// POST /api/customers
pub async fn create_customer(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<Customer>), ApiError> {
    if req.code.trim().is_empty() || req.company_name.trim().is_empty() {
        return Err(ApiError::bad_request("code and companyName are required"));
    }
    let code = validate_code(req.code.trim())?;

    let now = chrono::Utc::now();
    let customer = Customer {
        id: uuid::Uuid::new_v4().to_string(),
        code,
        company_name: req.company_name.trim().to_string(),
        tax_id: req.tax_id,
        email: req.email,
        is_active: true,
        is_deleted: false,
        created_at: now,
        updated_at: now,
    };

    let customer = state.store.create_customer(&customer).await.map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::conflict(format!("customer code {} already exists", customer.code))
        } else {
            e.into()
        }
    })?;
    Ok(created(customer))
}

/// GET /api/customers/:id
pub async fn get_customer(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Customer>, ApiError> {
    let customer = state
        .store
        .get_customer(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Customer"))?;
    Ok(Json(customer))
}

/// POST /api/customers/:id/subscriptions
pub async fn create_subscription(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut sub): Json<Subscription>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    if state.store.get_customer(&id).await?.is_none() {
        return Err(ApiError::not_found("Customer"));
    }
    if state.store.get_product(&sub.product_id).await?.is_none() {
        return Err(ApiError::bad_request(format!("unknown product {}", sub.product_id)));
    }
    check_subscription_dates(&sub)?;
    if sub.id.trim().is_empty() {
        sub.id = uuid::Uuid::new_v4().to_string();
    }
    sub.customer_id = id;

    state.store.create_subscription(&sub).await.map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::conflict(format!("subscription {} already exists", sub.id))
        } else {
            e.into()
        }
    })?;
    Ok(created(sub))
}

fn check_subscription_dates(sub: &Subscription) -> Result<(), ApiError> {
    match sub.end_date {
        Some(end) if end < sub.start_date => Err(ApiError::bad_request("endDate must not precede startDate")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn subscription(end_offset_days: Option<i64>) -> Subscription {
        let start = Utc::now();
        Subscription {
            id: String::new(),
            customer_id: String::new(),
            product_id: "prod-erp".to_string(),
            subscription_type: SubscriptionType::Monthly,
            status: SubscriptionStatus::Active,
            max_users: 10,
            subscribed_modules: vec![],
            custom_features: FeatureMap::new(),
            start_date: start,
            end_date: end_offset_days.map(|d| start + Duration::days(d)),
        }
    }

    #[test]
    fn test_subscription_end_before_start_is_bad_request() {
        let err = check_subscription_dates(&subscription(Some(-1))).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(check_subscription_dates(&subscription(Some(30))).is_ok());
        assert!(check_subscription_dates(&subscription(None)).is_ok());
    }

    #[test]
    fn test_store_failure_is_server_error() {
        let err: ApiError = anyhow::anyhow!("database is locked").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_customer_code_must_be_host_safe() {
        for bad in ["acme corp", "acme.co", "acme/1"] {
            let err: ApiError = validate_code(bad).unwrap_err().into();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{}", bad);
        }
        assert_eq!(validate_code("acme-01").unwrap(), "ACME-01");
    }
}
