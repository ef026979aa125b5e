mod catalog;
mod customers;
mod outbox;
pub(crate) mod row_helpers;
mod tasks;
mod tenants;

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::models::*;

use catalog::CatalogRepo;
use customers::{CustomerRepo, SubscriptionRepo};
use outbox::OutboxRepo;
use tasks::TaskRepo;
use tenants::TenantRepo;

pub use outbox::NewOutboxMessage;

/// Typed error for "resource not found", recovered by downcast in the
/// API error handler.
#[derive(Debug)]
pub struct NotFoundError {
    pub resource: String,
    pub id: String,
}

impl NotFoundError {
    pub fn new(resource: &str, id: &str) -> Self {
        Self {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} not found: {}", self.resource, self.id)
    }
}

impl std::error::Error for NotFoundError {}

/// Instance columns rewritten in the same transaction as a task transition
#[derive(Debug, Clone)]
pub enum InstanceChange {
    Status(InstanceStatus),
    Features { active: FeatureMap, overrides: FeatureMap },
}

/// Result of a versioned task write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionWrite {
    /// The stored version moved on; nothing was written
    Stale,
    /// Written; carries the outbox row id when a message was enqueued
    Applied { outbox_id: Option<i64> },
}

/// Store handles all database operations, delegating to per-entity repo modules.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a new database store with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Fresh migrated database held on a single connection
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ========== Customer Operations ==========

    pub async fn get_customer(&self, id: &str) -> Result<Option<Customer>> {
        CustomerRepo::get(&self.pool, id).await
    }

    pub async fn create_customer(&self, customer: &Customer) -> Result<Customer> {
        CustomerRepo::create(&self.pool, customer).await
    }

    pub async fn find_subscription(&self, customer_id: &str, product_id: &str) -> Result<Option<Subscription>> {
        SubscriptionRepo::find_for_product(&self.pool, customer_id, product_id).await
    }

    pub async fn create_subscription(&self, sub: &Subscription) -> Result<()> {
        SubscriptionRepo::create(&self.pool, sub).await
    }

    // ========== Catalog Operations ==========

    pub async fn get_product(&self, id: &str) -> Result<Option<Product>> {
        CatalogRepo::get_product(&self.pool, id).await
    }

    pub async fn get_plan(&self, id: &str) -> Result<Option<SubscriptionPlan>> {
        CatalogRepo::get_plan(&self.pool, id).await
    }

    pub async fn list_modules(&self) -> Result<Vec<CatalogModule>> {
        CatalogRepo::list_modules(&self.pool).await
    }

    pub async fn list_features(&self) -> Result<Vec<FeatureDefinition>> {
        CatalogRepo::list_features(&self.pool).await
    }

    pub async fn create_product(&self, product: &Product) -> Result<()> {
        CatalogRepo::create_product(&self.pool, product).await
    }

    pub async fn create_plan(&self, plan: &SubscriptionPlan) -> Result<()> {
        CatalogRepo::create_plan(&self.pool, plan).await
    }

    pub async fn create_module(&self, module: &CatalogModule) -> Result<()> {
        CatalogRepo::create_module(&self.pool, module).await
    }

    pub async fn create_feature(&self, feature: &FeatureDefinition) -> Result<()> {
        CatalogRepo::create_feature(&self.pool, feature).await
    }

    // ========== Tenant Instance Operations ==========

    pub async fn get_instance(&self, id: &str) -> Result<Option<TenantInstance>> {
        TenantRepo::get(&self.pool, id).await
    }

    pub async fn find_instance_by_customer_code(
        &self,
        customer_id: &str,
        code: &str,
    ) -> Result<Option<TenantInstance>> {
        TenantRepo::find_by_customer_and_code(&self.pool, customer_id, code).await
    }

    pub async fn list_instances_by_user_code(&self, code: &str) -> Result<Vec<TenantInstance>> {
        TenantRepo::list_by_user_code(&self.pool, code).await
    }

    pub async fn get_instance_by_tenant_code(&self, tenant_code: &str) -> Result<Option<TenantInstance>> {
        TenantRepo::get_by_tenant_code(&self.pool, tenant_code).await
    }

    pub async fn change_instance_status_if_idle(
        &self,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        TenantRepo::change_status_if_idle(&self.pool, id, from, to, chrono::Utc::now()).await
    }

    // ========== Task Operations ==========

    pub async fn get_task(&self, task_id: &str) -> Result<Option<ProvisionTask>> {
        TaskRepo::get(&self.pool, task_id).await
    }

    pub async fn list_instance_tasks(&self, instance_id: &str) -> Result<Vec<ProvisionTask>> {
        TaskRepo::list_by_instance(&self.pool, instance_id).await
    }

    pub async fn count_tasks_by_status(&self, instance_id: &str) -> Result<Vec<(TaskStatus, i64)>> {
        TaskRepo::count_by_status(&self.pool, instance_id).await
    }

    pub async fn recent_failed_tasks(&self, instance_id: &str, limit: i64) -> Result<Vec<ProvisionTask>> {
        TaskRepo::recent_failures(&self.pool, instance_id, limit).await
    }

    pub async fn find_live_task(&self, instance_id: &str) -> Result<Option<ProvisionTask>> {
        let mut conn = self.pool.acquire().await?;
        TaskRepo::find_live(&mut conn, instance_id).await
    }

    // ========== Outbox Operations ==========

    pub async fn list_pending_outbox(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        OutboxRepo::list_pending(&self.pool, limit).await
    }

    pub async fn list_task_outbox(&self, task_id: &str) -> Result<Vec<OutboxMessage>> {
        OutboxRepo::list_by_task(&self.pool, task_id).await
    }

    pub async fn enqueue_outbox(&self, msg: &NewOutboxMessage) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        OutboxRepo::insert(&mut conn, msg, chrono::Utc::now()).await
    }

    pub async fn mark_outbox_delivered(&self, id: i64) -> Result<()> {
        OutboxRepo::mark_delivered(&self.pool, id).await
    }

    pub async fn record_outbox_failure(&self, id: i64, error: &str) -> Result<()> {
        OutboxRepo::record_failure(&self.pool, id, error).await
    }

    pub async fn discard_outbox(&self, id: i64, reason: &str) -> Result<()> {
        OutboxRepo::discard(&self.pool, id, reason).await
    }

    // ========== Transactional Writes ==========

    /// Instance, its first task and the task's outbox message, all or nothing.
    /// Returns the outbox row id.
    pub async fn create_provisioning(
        &self,
        instance: &TenantInstance,
        task: &ProvisionTask,
        outbox: &NewOutboxMessage,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        TenantRepo::insert(&mut *tx, instance).await?;
        TaskRepo::insert(&mut *tx, task).await?;
        let outbox_id = OutboxRepo::insert(&mut *tx, outbox, task.created_at).await?;
        tx.commit().await?;
        Ok(outbox_id)
    }

    /// A new task for an existing instance plus its outbox message.
    /// Fails with a UNIQUE violation when the instance already has a live task.
    pub async fn create_task(&self, task: &ProvisionTask, outbox: &NewOutboxMessage) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        TaskRepo::insert(&mut *tx, task).await?;
        let outbox_id = OutboxRepo::insert(&mut *tx, outbox, task.created_at).await?;
        tx.commit().await?;
        Ok(outbox_id)
    }

    /// Persist a task transition guarded by `expected_version`, with the
    /// instance change and outbox message it implies in the same transaction.
    pub async fn commit_task_transition(
        &self,
        task: &ProvisionTask,
        expected_version: i64,
        instance_change: Option<&InstanceChange>,
        outbox: Option<&NewOutboxMessage>,
    ) -> Result<TransitionWrite> {
        let mut tx = self.pool.begin().await?;

        if !TaskRepo::update_versioned(&mut *tx, task, expected_version).await? {
            tx.rollback().await?;
            return Ok(TransitionWrite::Stale);
        }

        match instance_change {
            Some(InstanceChange::Status(status)) => {
                TenantRepo::update_status(&mut *tx, &task.tenant_instance_id, *status, task.updated_at).await?;
            }
            Some(InstanceChange::Features { active, overrides }) => {
                TenantRepo::update_features(&mut *tx, &task.tenant_instance_id, active, overrides, task.updated_at)
                    .await?;
            }
            None => {}
        }

        let outbox_id = match outbox {
            Some(msg) => Some(OutboxRepo::insert(&mut *tx, msg, task.updated_at).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(TransitionWrite::Applied { outbox_id })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Seed rows shared by the database and service tests

    use super::*;
    use chrono::{Duration, Utc};

    pub const CUSTOMER_ID: &str = "cust-1";
    pub const PRODUCT_ID: &str = "prod-erp";
    pub const PLAN_ID: &str = "plan-pro";

    /// One customer, one product with an "ops" module holding a free
    /// feature and a licensed one, and an active subscription.
    pub async fn seeded_store() -> Store {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        store
            .create_customer(&Customer {
                id: CUSTOMER_ID.to_string(),
                code: "ACME".to_string(),
                company_name: "Acme Corp".to_string(),
                tax_id: "900123".to_string(),
                email: "ops@acme.test".to_string(),
                is_active: true,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        store
            .create_product(&Product {
                id: PRODUCT_ID.to_string(),
                code: "ERP".to_string(),
                name: "ERP".to_string(),
                is_active: true,
            })
            .await
            .unwrap();

        store
            .create_plan(&SubscriptionPlan {
                id: PLAN_ID.to_string(),
                product_id: PRODUCT_ID.to_string(),
                code: "PRO".to_string(),
                name: "Professional".to_string(),
                is_active: true,
                modules: vec!["ops".to_string()],
            })
            .await
            .unwrap();

        store
            .create_module(&CatalogModule {
                id: "mod-ops".to_string(),
                product_id: PRODUCT_ID.to_string(),
                code: "ops".to_string(),
                name: "Operations".to_string(),
            })
            .await
            .unwrap();

        for (code, licensed, default_value) in [
            ("inventory", false, FeatureValue::Flag(true)),
            ("max_warehouses", true, FeatureValue::Limit(3)),
        ] {
            store
                .create_feature(&FeatureDefinition {
                    id: format!("feat-{}", code),
                    module_id: "mod-ops".to_string(),
                    code: code.to_string(),
                    name: code.to_string(),
                    requires_license: licensed,
                    additional_cost: 0.0,
                    default_value,
                    is_active: true,
                })
                .await
                .unwrap();
        }

        store
            .create_subscription(&Subscription {
                id: "sub-1".to_string(),
                customer_id: CUSTOMER_ID.to_string(),
                product_id: PRODUCT_ID.to_string(),
                subscription_type: SubscriptionType::Monthly,
                status: SubscriptionStatus::Active,
                max_users: 10,
                subscribed_modules: vec!["ops".to_string()],
                custom_features: FeatureMap::new(),
                start_date: now - Duration::days(1),
                end_date: Some(now + Duration::days(30)),
            })
            .await
            .unwrap();

        store
    }

    pub fn instance(id: &str, code: Option<&str>) -> TenantInstance {
        let now = Utc::now();
        TenantInstance {
            id: id.to_string(),
            customer_id: CUSTOMER_ID.to_string(),
            product_id: PRODUCT_ID.to_string(),
            subscription_plan_id: PLAN_ID.to_string(),
            tenant_code: format!("ACME-Shared-{}", &id.replace('-', "")),
            code: code.map(str::to_string),
            name: "Acme".to_string(),
            deployment_type: DeploymentType::Shared,
            status: InstanceStatus::Provisioning,
            active_features: FeatureMap::new(),
            feature_overrides: FeatureMap::new(),
            api_base_url: None,
            is_deleted: false,
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outbox_for(task: &ProvisionTask) -> NewOutboxMessage {
        NewOutboxMessage {
            task_id: task.task_id.clone(),
            subject: "provisioning.tasks".to_string(),
            payload: "{}".to_string(),
        }
    }
}
