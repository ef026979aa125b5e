use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::ProvisionTask;

/// Subject for domain event: tenant instance record created
pub const SUBJECT_TENANT_CREATED: &str = "tenants.created";
/// Subject for domain event: tenant instance finished provisioning
pub const SUBJECT_INSTANCE_PROVISIONED: &str = "instances.provisioned";

/// Wire record consumed by the worker pool. A retry sends a new message
/// with a higher `attempt`; a sent message is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningTaskMessage {
    pub task_id: String,
    pub tenant_id: String,
    pub task_type: String,
    pub module_id: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub attempt: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl ProvisioningTaskMessage {
    /// Message for the task's current attempt
    pub fn for_task(task: &ProvisionTask, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            tenant_id: task.tenant_instance_id.clone(),
            task_type: task.task_type.wire_name().to_string(),
            module_id: "all".to_string(),
            payload: task.payload.clone(),
            attempt: task.attempt(),
            max_retries: task.max_retries,
            created_at: now,
        }
    }
}

/// A message waiting in (or delivered from) the outbox
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub id: i64,
    pub task_id: String,
    pub subject: String,
    pub payload: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantCreatedEvent {
    pub customer_id: String,
    pub tenant_instance_id: String,
    pub tenant_code: String,
    pub initiated_by: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProvisionedEvent {
    pub customer_id: String,
    pub tenant_instance_id: String,
    pub tenant_code: String,
    pub owner_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;

    #[test]
    fn test_message_uses_current_attempt() {
        let mut task = ProvisionTask::queued(
            "inst-9",
            TaskType::TenantDeprovision,
            5,
            serde_json::Map::new(),
            "tester",
            None,
            Utc::now(),
        );
        task.retry_count = 2;

        let msg = ProvisioningTaskMessage::for_task(&task, Utc::now());
        assert_eq!(msg.attempt, 3);
        assert_eq!(msg.task_type, "deprovision");
        assert_eq!(msg.tenant_id, "inst-9");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["taskId"], task.task_id.as_str());
        assert_eq!(json["maxRetries"], 5);
    }
}
