use chrono::{DateTime, Duration, Utc};
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use super::catalog::FeatureCatalog;
use super::entitlements::{plan_subscription, EntitlementResolver};
use super::error::{ProvisioningError, ProvisioningResult};
use super::payload_keys;
use super::tracker::task_outbox_message;
use crate::db::{row_helpers::is_unique_violation, Store};
use crate::messaging::OutboxRelay;
use crate::models::*;
use crate::ws::{EventType, Hub};

const CODE_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

const PROVISION_ESTIMATE_MINS: i64 = 5;
const DEPROVISION_ESTIMATE_MINS: i64 = 3;
const FEATURE_UPDATE_ESTIMATE_MINS: i64 = 2;

/// Knobs for intake: where task messages go and how instance URLs are built
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    pub subject: String,
    pub default_max_retries: i32,
    pub use_local_urls: bool,
    pub production_domain: String,
    pub local_base_port: u16,
    /// Product code -> local port
    pub application_ports: HashMap<String, u16>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            subject: "provisioning.tasks".to_string(),
            default_max_retries: 5,
            use_local_urls: false,
            production_domain: "farutech.app".to_string(),
            local_base_port: 5100,
            application_ports: HashMap::new(),
        }
    }
}

impl ProvisioningSettings {
    pub fn api_base_url(&self, tenant_code: &str, product_code: &str) -> String {
        if self.use_local_urls {
            let port = self
                .application_ports
                .get(product_code)
                .copied()
                .unwrap_or(self.local_base_port);
            format!("http://localhost:{}", port)
        } else {
            format!("https://{}.{}", tenant_code.to_lowercase(), self.production_domain)
        }
    }
}

/// Entry point for provisioning requests. Validates, writes the instance,
/// task and outbox message in one transaction, then publishes.
pub struct ProvisioningCoordinator {
    store: Store,
    relay: Arc<OutboxRelay>,
    ws_hub: Option<Arc<Hub>>,
    settings: ProvisioningSettings,
}

impl ProvisioningCoordinator {
    pub fn new(
        store: Store,
        relay: Arc<OutboxRelay>,
        ws_hub: Option<Arc<Hub>>,
        settings: ProvisioningSettings,
    ) -> Self {
        Self {
            store,
            relay,
            ws_hub,
            settings,
        }
    }

    pub async fn provision_tenant(
        &self,
        req: &ProvisionTenantRequest,
        initiated_by: &str,
    ) -> ProvisioningResult<ProvisionTenantResponse> {
        let deployment_type: DeploymentType = req
            .deployment_type
            .parse()
            .map_err(|e: ParseEnumError| ProvisioningError::validation(e.to_string()))?;
        let code = normalize_code(req.code.as_deref())?;

        let customer = self
            .store
            .get_customer(&req.customer_id)
            .await?
            .filter(|c| c.is_active && !c.is_deleted)
            .ok_or_else(|| ProvisioningError::validation(format!("unknown or inactive customer {}", req.customer_id)))?;
        let product = self
            .store
            .get_product(&req.product_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ProvisioningError::validation(format!("unknown or inactive product {}", req.product_id)))?;
        let plan = self
            .store
            .get_plan(&req.subscription_plan_id)
            .await?
            .filter(|p| p.is_active && p.product_id == product.id)
            .ok_or_else(|| {
                ProvisioningError::validation(format!(
                    "unknown or inactive subscription plan {} for product {}",
                    req.subscription_plan_id, product.code
                ))
            })?;

        if let Some(code) = &code {
            if self.store.find_instance_by_customer_code(&customer.id, code).await?.is_some() {
                return Err(ProvisioningError::conflict(format!(
                    "customer {} already has an instance with code {}",
                    customer.code, code
                )));
            }
        }

        let now = Utc::now();
        let overrides = req.custom_features.clone().unwrap_or_default();
        let subscription = self.subscription_for(&customer.id, &plan, now).await?;
        let catalog = FeatureCatalog::load(&self.store).await?;
        let active_features = EntitlementResolver::new(&catalog).resolve(&subscription, &overrides, now);

        let tenant_code = generate_tenant_code(&customer.code, deployment_type);
        let instance = TenantInstance {
            id: uuid::Uuid::new_v4().to_string(),
            customer_id: customer.id.clone(),
            product_id: product.id.clone(),
            subscription_plan_id: plan.id.clone(),
            api_base_url: Some(self.settings.api_base_url(&tenant_code, &product.code)),
            tenant_code,
            name: req
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} {}", customer.company_name, product.name)),
            code,
            deployment_type,
            status: InstanceStatus::Provisioning,
            active_features,
            feature_overrides: overrides,
            is_deleted: false,
            created_by: initiated_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut payload = serde_json::Map::new();
        payload.insert(payload_keys::TENANT_CODE.into(), instance.tenant_code.clone().into());
        payload.insert(payload_keys::CUSTOMER_ID.into(), customer.id.clone().into());
        payload.insert(payload_keys::PRODUCT_ID.into(), product.id.clone().into());
        payload.insert(payload_keys::DEPLOYMENT_TYPE.into(), deployment_type.as_str().into());
        payload.insert(payload_keys::SUBSCRIPTION_PLAN_ID.into(), plan.id.clone().into());
        payload.insert(payload_keys::FEATURES.into(), to_value(&instance.feature_overrides)?);
        payload.insert(payload_keys::ACTIVE_FEATURES.into(), to_value(&instance.active_features)?);
        payload.insert(payload_keys::USER_ID.into(), initiated_by.into());

        let task = ProvisionTask::queued(
            &instance.id,
            TaskType::TenantProvision,
            self.settings.default_max_retries,
            payload,
            initiated_by,
            Some(now + Duration::minutes(PROVISION_ESTIMATE_MINS)),
            now,
        );
        let outbox = task_outbox_message(&task, &self.settings.subject, now)?;

        let outbox_id = self
            .store
            .create_provisioning(&instance, &task, &outbox)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ProvisioningError::conflict("an instance with this code already exists for the customer")
                } else {
                    ProvisioningError::Store(e)
                }
            })?;

        tracing::info!(
            "Provisioning {} for customer {} queued as task {}",
            instance.tenant_code,
            customer.code,
            task.task_id
        );

        // Records are committed; delivery problems from here on are absorbed
        self.relay.deliver(outbox_id, &outbox.subject, &outbox.payload).await;
        self.broadcast_queued(&task).await;

        let event = TenantCreatedEvent {
            customer_id: customer.id,
            tenant_instance_id: instance.id.clone(),
            tenant_code: instance.tenant_code.clone(),
            initiated_by: initiated_by.to_string(),
            occurred_at: now,
        };
        self.relay.bus().publish(SUBJECT_TENANT_CREATED, &event).await;

        Ok(ProvisionTenantResponse {
            tenant_instance_id: instance.id,
            tenant_code: instance.tenant_code,
            status: task.status.as_str().to_string(),
            tracking: TaskTrackingInfo::for_task(&task.task_id, task.estimated_completion),
            task_id: task.task_id,
            created_at: now,
        })
    }

    pub async fn deprovision_tenant(
        &self,
        instance_id: &str,
        reason: Option<&str>,
        initiated_by: &str,
    ) -> ProvisioningResult<AsyncTaskResponse> {
        let instance = self.require_instance(instance_id).await?;
        if instance.status == InstanceStatus::Deprovisioned {
            return Err(ProvisioningError::conflict(format!(
                "instance {} is already deprovisioned",
                instance.tenant_code
            )));
        }

        let mut payload = serde_json::Map::new();
        payload.insert(payload_keys::TENANT_CODE.into(), instance.tenant_code.clone().into());
        payload.insert(
            payload_keys::REASON.into(),
            reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or("user_request").into(),
        );

        self.queue_instance_task(&instance, TaskType::TenantDeprovision, payload, DEPROVISION_ESTIMATE_MINS, initiated_by)
            .await
    }

    /// Merge new instance-level overrides over the stored ones and queue a
    /// feature update carrying the re-resolved feature set.
    pub async fn update_tenant_features(
        &self,
        instance_id: &str,
        features: &FeatureMap,
        initiated_by: &str,
    ) -> ProvisioningResult<AsyncTaskResponse> {
        if features.is_empty() {
            return Err(ProvisioningError::validation("features must not be empty"));
        }

        let instance = self.require_instance(instance_id).await?;
        if !matches!(instance.status, InstanceStatus::Active | InstanceStatus::Suspended) {
            return Err(ProvisioningError::conflict(format!(
                "features cannot change while instance is {}",
                instance.status.as_str()
            )));
        }

        let mut overrides = instance.feature_overrides.clone();
        overrides.extend(features.iter().map(|(k, v)| (k.clone(), *v)));
        let active = self.resolve_for(&instance, &overrides, Utc::now()).await?;

        let mut payload = serde_json::Map::new();
        payload.insert(payload_keys::TENANT_CODE.into(), instance.tenant_code.clone().into());
        payload.insert(payload_keys::FEATURES.into(), to_value(&overrides)?);
        payload.insert(payload_keys::ACTIVE_FEATURES.into(), to_value(&active)?);

        self.queue_instance_task(&instance, TaskType::FeatureUpdate, payload, FEATURE_UPDATE_ESTIMATE_MINS, initiated_by)
            .await
    }

    /// Suspend or reactivate an instance. Only `active` and `suspended` are
    /// reachable this way, and never while a task is queued or processing.
    pub async fn set_instance_status(
        &self,
        instance_id: &str,
        status: &str,
        initiated_by: &str,
    ) -> ProvisioningResult<TenantInstance> {
        let target: InstanceStatus = status
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(|e: ParseEnumError| ProvisioningError::validation(e.to_string()))?;
        if !matches!(target, InstanceStatus::Active | InstanceStatus::Suspended) {
            return Err(ProvisioningError::validation(format!(
                "status can only be set to active or suspended, not {}",
                target.as_str()
            )));
        }

        let instance = self.require_instance(instance_id).await?;
        if !matches!(instance.status, InstanceStatus::Active | InstanceStatus::Suspended) {
            return Err(ProvisioningError::conflict(format!(
                "status cannot change while instance is {}",
                instance.status.as_str()
            )));
        }
        if instance.status == target {
            return Ok(instance);
        }
        if let Some(live) = self.store.find_live_task(&instance.id).await? {
            return Err(live_task_conflict(&instance.id, &live.task_id));
        }

        if !self
            .store
            .change_instance_status_if_idle(&instance.id, instance.status, target)
            .await?
        {
            return Err(ProvisioningError::conflict(format!(
                "instance {} changed while updating its status",
                instance.tenant_code
            )));
        }

        tracing::info!(
            "Instance {} moved from {} to {} by {}",
            instance.tenant_code,
            instance.status.as_str(),
            target.as_str(),
            initiated_by
        );
        self.require_instance(instance_id).await
    }

    /// The feature map stored on the instance
    pub async fn stored_features(&self, instance_id: &str) -> ProvisioningResult<FeatureMap> {
        Ok(self.require_instance(instance_id).await?.active_features)
    }

    /// Entitlements recomputed from the subscription as it stands now
    pub async fn live_entitlements(&self, instance_id: &str) -> ProvisioningResult<FeatureMap> {
        let instance = self.require_instance(instance_id).await?;
        self.resolve_for(&instance, &instance.feature_overrides, Utc::now()).await
    }

    pub async fn feature_catalog(&self) -> ProvisioningResult<Vec<ModuleFeatures>> {
        Ok(FeatureCatalog::load(&self.store).await?.modules().to_vec())
    }

    async fn queue_instance_task(
        &self,
        instance: &TenantInstance,
        task_type: TaskType,
        payload: serde_json::Map<String, serde_json::Value>,
        estimate_mins: i64,
        initiated_by: &str,
    ) -> ProvisioningResult<AsyncTaskResponse> {
        if let Some(live) = self.store.find_live_task(&instance.id).await? {
            return Err(live_task_conflict(&instance.id, &live.task_id));
        }

        let now = Utc::now();
        let task = ProvisionTask::queued(
            &instance.id,
            task_type,
            self.settings.default_max_retries,
            payload,
            initiated_by,
            Some(now + Duration::minutes(estimate_mins)),
            now,
        );
        let outbox = task_outbox_message(&task, &self.settings.subject, now)?;

        // The partial unique index catches a task queued since the check above
        let outbox_id = self.store.create_task(&task, &outbox).await.map_err(|e| {
            if is_unique_violation(&e) {
                live_task_conflict(&instance.id, "unknown")
            } else {
                ProvisioningError::Store(e)
            }
        })?;

        tracing::info!(
            "Queued {} task {} for {}",
            task_type.as_str(),
            task.task_id,
            instance.tenant_code
        );

        self.relay.deliver(outbox_id, &outbox.subject, &outbox.payload).await;
        self.broadcast_queued(&task).await;

        Ok(AsyncTaskResponse {
            tenant_instance_id: instance.id.clone(),
            status: task.status.as_str().to_string(),
            initiated_at: now,
            tracking: TaskTrackingInfo::for_task(&task.task_id, task.estimated_completion),
            task_id: task.task_id,
        })
    }

    async fn require_instance(&self, instance_id: &str) -> ProvisioningResult<TenantInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .filter(|i| !i.is_deleted)
            .ok_or_else(|| ProvisioningError::not_found("Tenant instance", instance_id))
    }

    /// The customer's subscription for the plan's product, or one derived
    /// from the plan when none is on record.
    async fn subscription_for(
        &self,
        customer_id: &str,
        plan: &SubscriptionPlan,
        now: DateTime<Utc>,
    ) -> ProvisioningResult<Subscription> {
        Ok(self
            .store
            .find_subscription(customer_id, &plan.product_id)
            .await?
            .unwrap_or_else(|| plan_subscription(customer_id, plan, now)))
    }

    async fn resolve_for(
        &self,
        instance: &TenantInstance,
        overrides: &FeatureMap,
        now: DateTime<Utc>,
    ) -> ProvisioningResult<FeatureMap> {
        let plan = self
            .store
            .get_plan(&instance.subscription_plan_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("Subscription plan", &instance.subscription_plan_id))?;
        let subscription = self.subscription_for(&instance.customer_id, &plan, now).await?;
        let catalog = FeatureCatalog::load(&self.store).await?;
        Ok(EntitlementResolver::new(&catalog).resolve(&subscription, overrides, now))
    }

    async fn broadcast_queued(&self, task: &ProvisionTask) {
        if let Some(hub) = &self.ws_hub {
            hub.broadcast_task(EventType::TaskQueued, task).await;
        }
    }
}

/// Trimmed and upper-cased; `None` when absent or blank
fn normalize_code(code: Option<&str>) -> ProvisioningResult<Option<String>> {
    match code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => validate_code(c).map(Some),
        None => Ok(None),
    }
}

/// Upper-cased form of a code that ends up in tenant codes and host names
pub(crate) fn validate_code(code: &str) -> ProvisioningResult<String> {
    let re = Regex::new(CODE_PATTERN).map_err(anyhow::Error::from)?;
    if !re.is_match(code) {
        return Err(ProvisioningError::validation(format!(
            "code '{}' may only contain letters, digits, '-' and '_'",
            code
        )));
    }
    Ok(code.to_uppercase())
}

fn generate_tenant_code(customer_code: &str, deployment_type: DeploymentType) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{}-{}-{}", customer_code, deployment_type.as_str(), suffix)
}

fn live_task_conflict(instance_id: &str, task_id: &str) -> ProvisioningError {
    ProvisioningError::conflict(format!(
        "instance {} already has a task in progress ({})",
        instance_id, task_id
    ))
}

fn to_value(features: &FeatureMap) -> ProvisioningResult<serde_json::Value> {
    Ok(serde_json::to_value(features).map_err(anyhow::Error::from)?)
}
