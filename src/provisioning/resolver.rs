use super::error::{ProvisioningError, ProvisioningResult};
use crate::db::Store;
use crate::models::*;

/// Resolves a public instance code to what a client needs to bootstrap
pub struct TenantResolver {
    store: Store,
}

impl TenantResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// User codes are tried first, then system tenant codes. `organization`
    /// (a customer code) disambiguates user codes shared across customers.
    pub async fn resolve(&self, code: &str, organization: Option<&str>) -> ProvisioningResult<ResolveResponseDto> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ProvisioningError::validation("code is required"));
        }
        let organization = organization.map(str::trim).filter(|o| !o.is_empty());

        let instance = match self.by_user_code(code, organization).await? {
            Some(instance) => instance,
            None => self.by_tenant_code(code, organization).await?,
        };

        let customer = self
            .store
            .get_customer(&instance.customer_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("Customer", &instance.customer_id))?;

        // Suspended and deprovisioned instances still resolve for diagnostics
        let active = instance.status == InstanceStatus::Active;
        Ok(ResolveResponseDto {
            instance_id: instance.id,
            instance_name: instance.name,
            organization_id: customer.id,
            organization_name: customer.company_name,
            application_url: if active { instance.api_base_url } else { None },
            status: instance.status,
            requires_authentication: active,
        })
    }

    async fn by_user_code(&self, code: &str, organization: Option<&str>) -> ProvisioningResult<Option<TenantInstance>> {
        let mut candidates = Vec::new();
        for instance in self.store.list_instances_by_user_code(code).await? {
            if instance.is_deleted {
                continue;
            }
            if let Some(org) = organization {
                if !self.belongs_to(&instance, org).await? {
                    continue;
                }
            }
            candidates.push(instance);
        }

        if candidates.len() > 1 {
            return Err(ProvisioningError::conflict(format!(
                "code '{}' is used by several organizations, specify one",
                code
            )));
        }
        Ok(candidates.pop())
    }

    async fn by_tenant_code(&self, code: &str, organization: Option<&str>) -> ProvisioningResult<TenantInstance> {
        let instance = self
            .store
            .get_instance_by_tenant_code(code)
            .await?
            .filter(|i| !i.is_deleted)
            .ok_or_else(|| ProvisioningError::not_found("Tenant instance", code))?;

        if let Some(org) = organization {
            if !self.belongs_to(&instance, org).await? {
                return Err(ProvisioningError::not_found("Tenant instance", code));
            }
        }
        Ok(instance)
    }

    async fn belongs_to(&self, instance: &TenantInstance, organization: &str) -> ProvisioningResult<bool> {
        let customer = self.store.get_customer(&instance.customer_id).await?;
        Ok(customer.is_some_and(|c| c.code.eq_ignore_ascii_case(organization)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_fixtures::*;
    use crate::db::InstanceChange;
    use chrono::Utc;

    fn queued_task(instance_id: &str, task_type: TaskType) -> ProvisionTask {
        ProvisionTask::queued(
            instance_id,
            task_type,
            5,
            serde_json::Map::new(),
            "tester",
            None,
            Utc::now(),
        )
    }

    async fn insert_instance(store: &Store, inst: &TenantInstance) {
        let task = queued_task(&inst.id, TaskType::TenantProvision);
        store.create_provisioning(inst, &task, &outbox_for(&task)).await.unwrap();
    }

    async fn add_instance(store: &Store, id: &str, customer_id: &str, code: Option<&str>) -> TenantInstance {
        let mut inst = instance(id, code);
        inst.customer_id = customer_id.to_string();
        inst.api_base_url = Some(format!("https://{}.farutech.app", id));
        insert_instance(store, &inst).await;
        inst
    }

    /// Run `task_id` through processing to completion, applying `outcome`
    async fn finish_task(store: &Store, task_id: &str, outcome: InstanceStatus) {
        let mut task = store.get_task(task_id).await.unwrap().unwrap();
        task.mark_processing("w", Utc::now()).unwrap();
        store.commit_task_transition(&task, task.version, None, None).await.unwrap();
        let mut task = store.get_task(task_id).await.unwrap().unwrap();
        task.complete(Utc::now()).unwrap();
        let change = InstanceChange::Status(outcome);
        store.commit_task_transition(&task, task.version, Some(&change), None).await.unwrap();
    }

    async fn activate(store: &Store, instance_id: &str) {
        let task = store.list_instance_tasks(instance_id).await.unwrap().remove(0);
        finish_task(store, &task.task_id, InstanceStatus::Active).await;
    }

    async fn deprovision(store: &Store, instance_id: &str) {
        let task = queued_task(instance_id, TaskType::TenantDeprovision);
        store.create_task(&task, &outbox_for(&task)).await.unwrap();
        finish_task(store, &task.task_id, InstanceStatus::Deprovisioned).await;
    }

    async fn second_customer(store: &Store) {
        let now = Utc::now();
        store
            .create_customer(&Customer {
                id: "cust-2".to_string(),
                code: "GLOBEX".to_string(),
                company_name: "Globex".to_string(),
                tax_id: String::new(),
                email: String::new(),
                is_active: true,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_active_instance_resolves_with_url() {
        let store = seeded_store().await;
        add_instance(&store, "inst-1", CUSTOMER_ID, Some("MAIN")).await;
        activate(&store, "inst-1").await;

        let dto = TenantResolver::new(store).resolve("main", None).await.unwrap();
        assert_eq!(dto.instance_id, "inst-1");
        assert_eq!(dto.organization_name, "Acme Corp");
        assert_eq!(dto.status, InstanceStatus::Active);
        assert!(dto.requires_authentication);
        assert_eq!(dto.application_url.as_deref(), Some("https://inst-1.farutech.app"));
    }

    #[tokio::test]
    async fn test_provisioning_instance_hides_url() {
        let store = seeded_store().await;
        let inst = add_instance(&store, "inst-1", CUSTOMER_ID, None).await;

        let dto = TenantResolver::new(store).resolve(&inst.tenant_code, None).await.unwrap();
        assert_eq!(dto.status, InstanceStatus::Provisioning);
        assert!(!dto.requires_authentication);
        assert!(dto.application_url.is_none());
    }

    #[tokio::test]
    async fn test_shared_user_code_needs_organization() {
        let store = seeded_store().await;
        second_customer(&store).await;
        add_instance(&store, "inst-1", CUSTOMER_ID, Some("MAIN")).await;
        add_instance(&store, "inst-2", "cust-2", Some("MAIN")).await;
        let resolver = TenantResolver::new(store);

        let err = resolver.resolve("MAIN", None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Conflict(_)));

        let dto = resolver.resolve("MAIN", Some("globex")).await.unwrap();
        assert_eq!(dto.instance_id, "inst-2");
    }

    #[tokio::test]
    async fn test_soft_deleted_instance_is_not_found() {
        let store = seeded_store().await;
        let mut inst = instance("inst-1", Some("GONE"));
        inst.is_deleted = true;
        insert_instance(&store, &inst).await;
        let resolver = TenantResolver::new(store);

        let err = resolver.resolve("gone", None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::NotFound { .. }));
        let err = resolver.resolve(&inst.tenant_code, None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_deprovisioned_instance_resolves_without_url() {
        let store = seeded_store().await;
        let inst = add_instance(&store, "inst-1", CUSTOMER_ID, Some("OLD")).await;
        activate(&store, "inst-1").await;
        deprovision(&store, "inst-1").await;
        let resolver = TenantResolver::new(store);

        for code in ["old", inst.tenant_code.as_str()] {
            let dto = resolver.resolve(code, None).await.unwrap();
            assert_eq!(dto.instance_id, "inst-1");
            assert_eq!(dto.status, InstanceStatus::Deprovisioned);
            assert!(!dto.requires_authentication);
            assert!(dto.application_url.is_none());
        }
    }

    #[tokio::test]
    async fn test_suspended_instance_still_resolves() {
        let store = seeded_store().await;
        add_instance(&store, "inst-1", CUSTOMER_ID, Some("MAIN")).await;
        activate(&store, "inst-1").await;
        let changed = store
            .change_instance_status_if_idle("inst-1", InstanceStatus::Active, InstanceStatus::Suspended)
            .await
            .unwrap();
        assert!(changed);

        let dto = TenantResolver::new(store).resolve("MAIN", None).await.unwrap();
        assert_eq!(dto.status, InstanceStatus::Suspended);
        assert!(!dto.requires_authentication);
        assert!(dto.application_url.is_none());
    }

    #[tokio::test]
    async fn test_unknown_code_is_not_found() {
        let store = seeded_store().await;
        let err = TenantResolver::new(store).resolve("nope", None).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::NotFound { .. }));
    }
}
