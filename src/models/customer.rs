use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::catalog::FeatureMap;
use super::ParseEnumError;

/// Organization owning tenant instances and subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub code: String,
    pub company_name: String,
    pub tax_id: String,
    pub email: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCustomerRequest {
    pub code: String,
    pub company_name: String,
    #[serde(default)]
    pub tax_id: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Monthly,
    Annual,
    Perpetual,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Monthly => "monthly",
            SubscriptionType::Annual => "annual",
            SubscriptionType::Perpetual => "perpetual",
        }
    }
}

impl FromStr for SubscriptionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(SubscriptionType::Monthly),
            "annual" => Ok(SubscriptionType::Annual),
            "perpetual" => Ok(SubscriptionType::Perpetual),
            other => Err(ParseEnumError::new("subscription type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(ParseEnumError::new("subscription status", other)),
        }
    }
}

/// A customer's entitlement to a product
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    /// Taken from the request path on creation
    #[serde(default)]
    pub customer_id: String,
    pub product_id: String,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub max_users: i32,
    pub subscribed_modules: Vec<String>,
    pub custom_features: FeatureMap,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl Subscription {
    /// True when license-gated features may be granted at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.start_date <= now
            && self.end_date.map_or(true, |end| end >= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: "sub-1".into(),
            customer_id: "cust-1".into(),
            product_id: "prod-1".into(),
            subscription_type: SubscriptionType::Monthly,
            status,
            max_users: 10,
            subscribed_modules: vec![],
            custom_features: FeatureMap::new(),
            start_date: now - Duration::days(30),
            end_date: None,
        }
    }

    #[test]
    fn test_active_subscription_window() {
        let now = Utc::now();
        let mut sub = subscription(SubscriptionStatus::Active);
        assert!(sub.is_active_at(now));

        sub.end_date = Some(now - Duration::days(1));
        assert!(!sub.is_active_at(now));

        sub.end_date = None;
        sub.start_date = now + Duration::days(1);
        assert!(!sub.is_active_at(now));
    }

    #[test]
    fn test_suspended_subscription_is_not_active() {
        let sub = subscription(SubscriptionStatus::Suspended);
        assert!(!sub.is_active_at(Utc::now()));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in ["active", "suspended", "cancelled", "expired"] {
            assert_eq!(s.parse::<SubscriptionStatus>().unwrap().as_str(), s);
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }
}
