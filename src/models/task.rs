use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TenantProvision,
    TenantDeprovision,
    FeatureUpdate,
    InvoiceGeneration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TenantProvision => "tenant_provision",
            TaskType::TenantDeprovision => "tenant_deprovision",
            TaskType::FeatureUpdate => "feature_update",
            TaskType::InvoiceGeneration => "invoice_generation",
        }
    }

    /// Verb the worker pool dispatches on
    pub fn wire_name(&self) -> &'static str {
        match self {
            TaskType::TenantProvision => "provision",
            TaskType::TenantDeprovision => "deprovision",
            TaskType::FeatureUpdate => "update",
            TaskType::InvoiceGeneration => "invoice",
        }
    }
}

impl FromStr for TaskType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant_provision" => Ok(TaskType::TenantProvision),
            "tenant_deprovision" => Ok(TaskType::TenantDeprovision),
            "feature_update" => Ok(TaskType::FeatureUpdate),
            "invoice_generation" => Ok(TaskType::InvoiceGeneration),
            other => Err(ParseEnumError::new("task type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Failed is only ever stored once retries are exhausted, so it is terminal here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// Insertion-ordered set of completed step names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepSet(Vec<String>);

impl StepSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, step: &str) -> bool {
        self.0.iter().any(|s| s == step)
    }

    /// Returns false when the step was already recorded.
    pub fn insert(&mut self, step: &str) -> bool {
        if self.contains(step) {
            return false;
        }
        self.0.push(step.to_string());
        true
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for StepSet {
    fn from(steps: Vec<String>) -> Self {
        let mut set = StepSet::new();
        for step in &steps {
            set.insert(step);
        }
        set
    }
}

/// An illegal state-machine move
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a task in status {from}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub action: &'static str,
}

/// What `fail` did with the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue; the next message carries this attempt number
    Requeued { attempt: i32 },
    /// Retries exhausted, task is terminally failed
    Exhausted,
}

/// Durable record of one asynchronous unit of provisioning work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionTask {
    pub task_id: String,
    pub tenant_instance_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps_completed: StepSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Opaque payload sent to the worker with every attempt
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub initiated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub correlation_id: String,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl ProvisionTask {
    /// A freshly queued task on its first attempt.
    pub fn queued(
        tenant_instance_id: &str,
        task_type: TaskType,
        max_retries: i32,
        payload: serde_json::Map<String, serde_json::Value>,
        initiated_by: &str,
        estimated_completion: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            tenant_instance_id: tenant_instance_id.to_string(),
            task_type,
            status: TaskStatus::Queued,
            progress: 0,
            current_step: None,
            steps_completed: StepSet::new(),
            error_message: None,
            retry_count: 0,
            max_retries,
            payload,
            initiated_by: initiated_by.to_string(),
            worker_id: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            estimated_completion,
        }
    }

    /// Attempt number of the current (or next) delivery
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self.status, TaskStatus::Queued | TaskStatus::Processing)
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Queued && self.retry_count > 0 && self.retry_count < self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn require(&self, expected: TaskStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError { from: self.status, action });
        }
        Ok(())
    }

    pub fn mark_processing(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Queued, "start")?;
        self.status = TaskStatus::Processing;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a completed step. Returns false (and changes nothing) when the
    /// step was already recorded. Progress never moves backward.
    pub fn advance_step(&mut self, step: &str, progress: i32, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        self.require(TaskStatus::Processing, "advance")?;
        if !self.steps_completed.insert(step) {
            return Ok(false);
        }
        self.progress = self.progress.max(progress.clamp(0, 100));
        self.current_step = Some(step.to_string());
        self.updated_at = now;
        Ok(true)
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Processing, "complete")?;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error_message: &str, now: DateTime<Utc>) -> Result<FailOutcome, TransitionError> {
        self.require(TaskStatus::Processing, "fail")?;
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.error_message = Some(error_message.to_string());
        self.updated_at = now;

        if self.retry_count < self.max_retries {
            // Steps and progress survive so the next worker can resume.
            self.status = TaskStatus::Queued;
            self.worker_id = None;
            self.started_at = None;
            Ok(FailOutcome::Requeued { attempt: self.attempt() })
        } else {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
            Ok(FailOutcome::Exhausted)
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.can_cancel() {
            return Err(TransitionError { from: self.status, action: "cancel" });
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// GET /api/provisioning/tasks/:task_id/status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub steps_completed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    pub initiated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub tenant_instance_id: String,
    pub tracking: super::TaskTrackingInfo,
}

impl From<ProvisionTask> for TaskStatusResponse {
    fn from(task: ProvisionTask) -> Self {
        let tracking = super::TaskTrackingInfo::for_task(&task.task_id, task.estimated_completion);
        Self {
            steps_completed: task.steps_completed.as_slice().to_vec(),
            task_id: task.task_id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            current_step: task.current_step,
            error_message: task.error_message,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            estimated_completion: task.estimated_completion,
            initiated_by: task.initiated_by,
            worker_id: task.worker_id,
            tenant_instance_id: task.tenant_instance_id,
            tracking,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskSummary {
    pub task_id: String,
    pub task_type: TaskType,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

/// Per-instance task counts (GET /api/workers/:instance_id/queue)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub instance_id: String,
    pub instance_name: String,
    pub queued_tasks: i64,
    pub processing_tasks: i64,
    pub failed_tasks: i64,
    pub completed_tasks: i64,
    pub cancelled_tasks: i64,
    pub recent_failures: Vec<FailedTaskSummary>,
}

// ========== Worker callback requests ==========

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceStepRequest {
    pub step: String,
    pub progress: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailTaskRequest {
    pub error_message: String,
}
