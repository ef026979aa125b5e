//! Tenant provisioning: intake, entitlement resolution, task lifecycle
//! and code resolution.

pub mod catalog;
pub mod coordinator;
pub mod entitlements;
pub mod error;
pub mod resolver;
pub mod tracker;

pub use catalog::FeatureCatalog;
pub use coordinator::{ProvisioningCoordinator, ProvisioningSettings};
pub use entitlements::EntitlementResolver;
pub use error::{ProvisioningError, ProvisioningResult};
pub use resolver::TenantResolver;
pub use tracker::TaskTracker;

/// Keys of the task payload shared with the worker pool
pub(crate) mod payload_keys {
    pub const TENANT_CODE: &str = "tenant_code";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const PRODUCT_ID: &str = "product_id";
    pub const DEPLOYMENT_TYPE: &str = "deployment_type";
    pub const SUBSCRIPTION_PLAN_ID: &str = "subscription_plan_id";
    pub const USER_ID: &str = "user_id";
    pub const REASON: &str = "reason";
    /// Instance-level overrides
    pub const FEATURES: &str = "features";
    /// Resolved feature map the worker applies
    pub const ACTIVE_FEATURES: &str = "active_features";
}
