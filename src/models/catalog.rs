use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A resolved feature value: an on/off flag or a numeric limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Limit(i64),
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Flag(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Limit(v)
    }
}

/// Feature code -> value. Ordered so stored JSON is stable.
pub type FeatureMap = BTreeMap<String, FeatureValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    pub id: String,
    pub product_id: String,
    pub code: String,
    pub name: String,
    pub is_active: bool,
    /// Module ids included in the plan
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogModule {
    pub id: String,
    pub product_id: String,
    pub code: String,
    pub name: String,
}

/// Feature definition as supplied by the catalog store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    pub id: String,
    pub module_id: String,
    pub code: String,
    pub name: String,
    pub requires_license: bool,
    pub additional_cost: f64,
    pub default_value: FeatureValue,
    pub is_active: bool,
}

/// Catalog listing grouped by module (GET /api/catalog/features)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleFeatures {
    pub module: CatalogModule,
    pub features: Vec<FeatureDefinition>,
}
