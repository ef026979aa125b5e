use chrono::{DateTime, Utc};

use super::catalog::FeatureCatalog;
use crate::models::*;

/// Merges catalog defaults, subscription customizations and instance
/// overrides into the feature map an instance may use.
pub struct EntitlementResolver<'a> {
    catalog: &'a FeatureCatalog,
}

impl<'a> EntitlementResolver<'a> {
    pub fn new(catalog: &'a FeatureCatalog) -> Self {
        Self { catalog }
    }

    /// Later layers win key by key. Licensed catalog features are dropped
    /// unless the subscription is active at `now`, whatever the overrides say.
    pub fn resolve(
        &self,
        subscription: &Subscription,
        instance_overrides: &FeatureMap,
        now: DateTime<Utc>,
    ) -> FeatureMap {
        let mut merged = self
            .catalog
            .module_defaults(&subscription.product_id, &subscription.subscribed_modules);

        for (code, value) in subscription.custom_features.iter().chain(instance_overrides.iter()) {
            merged.insert(code.clone(), *value);
        }

        if !subscription.is_active_at(now) {
            merged.retain(|code, _| !self.catalog.requires_license(code));
        }

        merged
    }
}

/// Stand-in subscription built from a plan when the customer has none on
/// record for the product. Never persisted.
pub fn plan_subscription(customer_id: &str, plan: &SubscriptionPlan, now: DateTime<Utc>) -> Subscription {
    Subscription {
        id: format!("plan:{}", plan.id),
        customer_id: customer_id.to_string(),
        product_id: plan.product_id.clone(),
        subscription_type: SubscriptionType::Monthly,
        status: SubscriptionStatus::Active,
        max_users: 0,
        subscribed_modules: plan.modules.clone(),
        custom_features: FeatureMap::new(),
        start_date: now,
        end_date: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn catalog(reports_licensed: bool) -> FeatureCatalog {
        FeatureCatalog::new(
            vec![CatalogModule {
                id: "m-analytics".to_string(),
                product_id: "erp".to_string(),
                code: "analytics".to_string(),
                name: "Analytics".to_string(),
            }],
            vec![
                FeatureDefinition {
                    id: "f-reports".to_string(),
                    module_id: "m-analytics".to_string(),
                    code: "reports".to_string(),
                    name: "Reports".to_string(),
                    requires_license: reports_licensed,
                    additional_cost: 25.0,
                    default_value: FeatureValue::Flag(false),
                    is_active: true,
                },
                FeatureDefinition {
                    id: "f-dashboards".to_string(),
                    module_id: "m-analytics".to_string(),
                    code: "dashboards".to_string(),
                    name: "Dashboards".to_string(),
                    requires_license: false,
                    additional_cost: 0.0,
                    default_value: FeatureValue::Limit(5),
                    is_active: true,
                },
            ],
        )
    }

    fn subscription(status: SubscriptionStatus, custom: FeatureMap) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: "sub-1".to_string(),
            customer_id: "cust-1".to_string(),
            product_id: "erp".to_string(),
            subscription_type: SubscriptionType::Annual,
            status,
            max_users: 25,
            subscribed_modules: vec!["analytics".to_string()],
            custom_features: custom,
            start_date: now - Duration::days(10),
            end_date: None,
        }
    }

    fn map(entries: &[(&str, FeatureValue)]) -> FeatureMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_instance_override_wins() {
        let catalog = catalog(false);
        let resolver = EntitlementResolver::new(&catalog);
        let sub = subscription(SubscriptionStatus::Active, map(&[("reports", true.into())]));

        let resolved = resolver.resolve(&sub, &map(&[("reports", false.into())]), Utc::now());
        assert_eq!(resolved["reports"], FeatureValue::Flag(false));
        assert_eq!(resolved["dashboards"], FeatureValue::Limit(5));
    }

    #[test]
    fn test_subscription_override_beats_module_default() {
        let catalog = catalog(false);
        let resolver = EntitlementResolver::new(&catalog);
        let sub = subscription(SubscriptionStatus::Active, map(&[("reports", true.into())]));

        let resolved = resolver.resolve(&sub, &FeatureMap::new(), Utc::now());
        assert_eq!(resolved["reports"], FeatureValue::Flag(true));
    }

    #[test]
    fn test_licensed_feature_omitted_for_inactive_subscription() {
        let catalog = catalog(true);
        let resolver = EntitlementResolver::new(&catalog);
        let sub = subscription(SubscriptionStatus::Suspended, map(&[("reports", true.into())]));

        let resolved = resolver.resolve(&sub, &map(&[("reports", true.into())]), Utc::now());
        assert!(!resolved.contains_key("reports"));
        assert!(resolved.contains_key("dashboards"));
    }

    #[test]
    fn test_licensed_feature_kept_for_active_subscription() {
        let catalog = catalog(true);
        let resolver = EntitlementResolver::new(&catalog);
        let sub = subscription(SubscriptionStatus::Active, FeatureMap::new());

        let resolved = resolver.resolve(&sub, &FeatureMap::new(), Utc::now());
        assert_eq!(resolved["reports"], FeatureValue::Flag(false));
    }

    #[test]
    fn test_expired_window_counts_as_inactive() {
        let catalog = catalog(true);
        let resolver = EntitlementResolver::new(&catalog);
        let mut sub = subscription(SubscriptionStatus::Active, FeatureMap::new());
        sub.end_date = Some(Utc::now() - Duration::days(1));

        let resolved = resolver.resolve(&sub, &FeatureMap::new(), Utc::now());
        assert!(!resolved.contains_key("reports"));
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let catalog = catalog(true);
        let resolver = EntitlementResolver::new(&catalog);
        let sub = subscription(SubscriptionStatus::Cancelled, FeatureMap::new());

        let resolved = resolver.resolve(&sub, &map(&[("max_branches", 12i64.into())]), Utc::now());
        assert_eq!(resolved["max_branches"], FeatureValue::Limit(12));
    }

    #[test]
    fn test_plan_subscription_uses_plan_modules() {
        let plan = SubscriptionPlan {
            id: "plan-1".to_string(),
            product_id: "erp".to_string(),
            code: "BASIC".to_string(),
            name: "Basic".to_string(),
            is_active: true,
            modules: vec!["analytics".to_string()],
        };
        let now = Utc::now();
        let sub = plan_subscription("cust-1", &plan, now);
        assert!(sub.is_active_at(now));

        let catalog = catalog(false);
        let resolved = EntitlementResolver::new(&catalog).resolve(&sub, &FeatureMap::new(), now);
        assert_eq!(resolved.len(), 2);
    }
}
