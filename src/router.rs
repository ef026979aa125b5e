use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the application router with all routes
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::healthcheck))
        // Provisioning requests
        .route("/api/provisioning/provision", post(handlers::provisioning::provision_tenant))
        .route("/api/provisioning/:instance_id", delete(handlers::provisioning::deprovision_tenant))
        .route("/api/provisioning/:instance_id/features", put(handlers::provisioning::update_tenant_features))
        .route("/api/provisioning/tasks/:task_id/status", get(handlers::provisioning::get_task_status))
        .route("/api/provisioning/tasks/:task_id/cancel", post(handlers::provisioning::cancel_task))
        .route("/api/provisioning/tasks/:task_id/republish", post(handlers::provisioning::republish_task))
        .route("/api/provisioning/tasks/:task_id/messages", get(handlers::provisioning::list_task_messages))
        // Worker callbacks
        .route("/api/tasks/:task_id/start", post(handlers::tasks::start_task))
        .route("/api/tasks/:task_id/steps", post(handlers::tasks::advance_step))
        .route("/api/tasks/:task_id/complete", post(handlers::tasks::complete_task))
        .route("/api/tasks/:task_id/fail", post(handlers::tasks::fail_task))
        // Instance routes
        .route("/api/instances/:id/tasks", get(handlers::instances::list_instance_tasks))
        .route("/api/instances/:id/features", get(handlers::instances::get_instance_features))
        .route("/api/instances/:id/entitlements", get(handlers::instances::get_instance_entitlements))
        .route("/api/instances/:id/status", patch(handlers::instances::update_instance_status))
        .route("/api/workers/:instance_id/queue", get(handlers::instances::get_queue_status))
        // Customers and catalog
        .route("/api/customers", post(handlers::customers::create_customer))
        .route("/api/customers/:id", get(handlers::customers::get_customer))
        .route("/api/customers/:id/subscriptions", post(handlers::customers::create_subscription))
        .route("/api/catalog/features", get(handlers::catalog::list_catalog_features))
        .route("/api/catalog/features", post(handlers::catalog::create_feature))
        .route("/api/catalog/products", post(handlers::catalog::create_product))
        .route("/api/catalog/plans", post(handlers::catalog::create_plan))
        .route("/api/catalog/modules", post(handlers::catalog::create_module))
        // Resolution
        .route("/api/resolve/:code", get(handlers::resolve::resolve_code))
        // WebSocket route
        .route("/ws/tasks", get(crate::ws_upgrade_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
