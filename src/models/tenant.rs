use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::catalog::FeatureMap;
use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentType {
    Shared,
    Dedicated,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Shared => "Shared",
            DeploymentType::Dedicated => "Dedicated",
        }
    }
}

impl FromStr for DeploymentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Shared" => Ok(DeploymentType::Shared),
            "Dedicated" => Ok(DeploymentType::Dedicated),
            other => Err(ParseEnumError::new("deployment type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning,
    Active,
    Suspended,
    Deprovisioned,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Active => "active",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Deprovisioned => "deprovisioned",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(InstanceStatus::Provisioning),
            "active" => Ok(InstanceStatus::Active),
            "suspended" => Ok(InstanceStatus::Suspended),
            "deprovisioned" => Ok(InstanceStatus::Deprovisioned),
            other => Err(ParseEnumError::new("instance status", other)),
        }
    }
}

/// A provisioned (or provisioning) deployment for a customer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInstance {
    pub id: String,
    pub customer_id: String,
    pub product_id: String,
    pub subscription_plan_id: String,
    pub tenant_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub status: InstanceStatus,
    pub active_features: FeatureMap,
    /// Instance-level overrides kept so entitlements can be re-resolved later
    pub feature_overrides: FeatureMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    pub is_deleted: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// POST /api/provisioning/provision
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionTenantRequest {
    pub customer_id: String,
    pub product_id: String,
    #[serde(default = "default_deployment_type")]
    pub deployment_type: String,
    pub subscription_plan_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub custom_features: Option<FeatureMap>,
}

/// PUT /api/provisioning/:instance_id/features
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTenantFeaturesRequest {
    /// Instance-level overrides merged over the stored ones
    pub features: FeatureMap,
}

/// Optional body of DELETE /api/provisioning/:instance_id
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionTenantRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// PATCH /api/instances/:id/status
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceStatusRequest {
    pub status: String,
}

fn default_deployment_type() -> String {
    DeploymentType::Shared.as_str().to_string()
}

/// Where a client can follow an async task
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTrackingInfo {
    pub status_url: String,
    pub web_socket_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    pub progress_update_frequency: u32,
}

impl TaskTrackingInfo {
    pub fn for_task(task_id: &str, estimated_completion: Option<DateTime<Utc>>) -> Self {
        Self {
            status_url: format!("/api/provisioning/tasks/{}/status", task_id),
            web_socket_url: "/ws/tasks".to_string(),
            estimated_completion,
            progress_update_frequency: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionTenantResponse {
    pub tenant_instance_id: String,
    pub tenant_code: String,
    pub status: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub tracking: TaskTrackingInfo,
}

/// Response for deprovision and feature-update requests
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncTaskResponse {
    pub tenant_instance_id: String,
    pub task_id: String,
    pub status: String,
    pub initiated_at: DateTime<Utc>,
    pub tracking: TaskTrackingInfo,
}

/// Client bootstrap lookup result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponseDto {
    pub instance_id: String,
    pub instance_name: String,
    pub organization_id: String,
    pub organization_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_url: Option<String>,
    pub status: InstanceStatus,
    pub requires_authentication: bool,
}
