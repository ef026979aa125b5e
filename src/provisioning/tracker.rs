use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::error::{ProvisioningError, ProvisioningResult};
use super::payload_keys;
use crate::db::{InstanceChange, NewOutboxMessage, Store, TransitionWrite};
use crate::messaging::{OutboxRelay, PublishOutcome};
use crate::models::*;
use crate::ws::{EventType, Hub};

/// Concurrent writers are resolved by reloading and reapplying; give up
/// after this many lost races.
const MAX_WRITE_ATTEMPTS: usize = 8;

const RECENT_FAILURE_LIMIT: i64 = 5;

/// Side effects a transition commits together with the task row
struct Effects {
    event: EventType,
    instance_change: Option<InstanceChange>,
    outbox: Option<NewOutboxMessage>,
}

impl Effects {
    fn event(event: EventType) -> Self {
        Self {
            event,
            instance_change: None,
            outbox: None,
        }
    }
}

/// Owns the provisioning task state machine as reported by workers
pub struct TaskTracker {
    store: Store,
    relay: Arc<OutboxRelay>,
    ws_hub: Option<Arc<Hub>>,
    subject: String,
}

impl TaskTracker {
    pub fn new(store: Store, relay: Arc<OutboxRelay>, ws_hub: Option<Arc<Hub>>, subject: &str) -> Self {
        Self {
            store,
            relay,
            ws_hub,
            subject: subject.to_string(),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> ProvisioningResult<ProvisionTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("Task", task_id))
    }

    pub async fn task_status(&self, task_id: &str) -> ProvisioningResult<TaskStatusResponse> {
        Ok(self.get_task(task_id).await?.into())
    }

    pub async fn list_instance_tasks(&self, instance_id: &str) -> ProvisioningResult<Vec<ProvisionTask>> {
        self.require_instance(instance_id).await?;
        Ok(self.store.list_instance_tasks(instance_id).await?)
    }

    pub async fn queue_status(&self, instance_id: &str) -> ProvisioningResult<QueueStatus> {
        let instance = self.require_instance(instance_id).await?;
        let mut status = QueueStatus {
            instance_id: instance.id.clone(),
            instance_name: instance.name.clone(),
            queued_tasks: 0,
            processing_tasks: 0,
            failed_tasks: 0,
            completed_tasks: 0,
            cancelled_tasks: 0,
            recent_failures: Vec::new(),
        };

        for (task_status, count) in self.store.count_tasks_by_status(instance_id).await? {
            match task_status {
                TaskStatus::Queued => status.queued_tasks = count,
                TaskStatus::Processing => status.processing_tasks = count,
                TaskStatus::Failed => status.failed_tasks = count,
                TaskStatus::Completed => status.completed_tasks = count,
                TaskStatus::Cancelled => status.cancelled_tasks = count,
            }
        }

        status.recent_failures = self
            .store
            .recent_failed_tasks(instance_id, RECENT_FAILURE_LIMIT)
            .await?
            .into_iter()
            .map(|t| FailedTaskSummary {
                task_id: t.task_id,
                task_type: t.task_type,
                error_message: t.error_message.unwrap_or_default(),
                failed_at: t.completed_at,
                retry_count: t.retry_count,
            })
            .collect();

        Ok(status)
    }

    pub async fn mark_processing(&self, task_id: &str, worker_id: &str) -> ProvisioningResult<ProvisionTask> {
        if worker_id.trim().is_empty() {
            return Err(ProvisioningError::validation("workerId is required"));
        }

        let (task, _) = self
            .transition(task_id, |task, now| {
                task.mark_processing(worker_id, now)?;
                Ok(Some(Effects::event(EventType::TaskStarted)))
            })
            .await?;

        tracing::info!("Task {} picked up by worker {}", task.task_id, worker_id);
        Ok(task)
    }

    /// Record a finished step. Replaying a recorded step is a no-op.
    pub async fn advance_step(&self, task_id: &str, step: &str, progress: i32) -> ProvisioningResult<ProvisionTask> {
        if step.trim().is_empty() {
            return Err(ProvisioningError::validation("step is required"));
        }
        if !(0..=100).contains(&progress) {
            return Err(ProvisioningError::validation(format!(
                "progress must be between 0 and 100, got {}",
                progress
            )));
        }

        let (task, effects) = self
            .transition(task_id, |task, now| {
                if task.advance_step(step, progress, now)? {
                    Ok(Some(Effects::event(EventType::TaskProgress)))
                } else {
                    Ok(None)
                }
            })
            .await?;

        if effects.is_none() {
            tracing::debug!("Task {} already completed step {}", task.task_id, step);
        }
        Ok(task)
    }

    pub async fn complete(&self, task_id: &str) -> ProvisioningResult<ProvisionTask> {
        let (task, _) = self
            .transition(task_id, |task, now| {
                task.complete(now)?;
                Ok(Some(Effects {
                    event: EventType::TaskCompleted,
                    instance_change: completion_change(task)?,
                    outbox: None,
                }))
            })
            .await?;

        tracing::info!("Task {} ({}) completed", task.task_id, task.task_type.as_str());

        if task.task_type == TaskType::TenantProvision {
            self.publish_instance_provisioned(&task).await;
        }
        Ok(task)
    }

    /// Record a worker failure; requeues with a fresh message until retries
    /// run out.
    pub async fn fail(&self, task_id: &str, error_message: &str) -> ProvisioningResult<ProvisionTask> {
        let error_message = error_message.trim();
        if error_message.is_empty() {
            return Err(ProvisioningError::validation("errorMessage is required"));
        }

        let subject = self.subject.as_str();
        let (task, _) = self
            .transition(task_id, |task, now| match task.fail(error_message, now)? {
                FailOutcome::Requeued { .. } => Ok(Some(Effects {
                    event: EventType::TaskRequeued,
                    instance_change: None,
                    outbox: Some(task_outbox_message(task, subject, now)?),
                })),
                FailOutcome::Exhausted => Ok(Some(Effects::event(EventType::TaskFailed))),
            })
            .await?;

        if task.status == TaskStatus::Queued {
            tracing::warn!(
                "Task {} failed (attempt {}/{}), requeued: {}",
                task.task_id,
                task.retry_count,
                task.max_retries,
                error_message
            );
        } else {
            tracing::error!(
                "Task {} failed permanently after {} attempts: {}",
                task.task_id,
                task.retry_count,
                error_message
            );
        }
        Ok(task)
    }

    /// Cancel a live task. Workers notice by polling the task status.
    pub async fn cancel(&self, task_id: &str) -> ProvisioningResult<ProvisionTask> {
        let (task, _) = self
            .transition(task_id, |task, now| {
                task.cancel(now)?;
                Ok(Some(Effects::event(EventType::TaskCancelled)))
            })
            .await?;

        tracing::info!("Task {} cancelled", task.task_id);
        Ok(task)
    }

    /// Every message written for the task, oldest first
    pub async fn task_messages(&self, task_id: &str) -> ProvisioningResult<Vec<OutboxMessage>> {
        self.get_task(task_id).await?;
        Ok(self.store.list_task_outbox(task_id).await?)
    }

    /// Send the current attempt of a queued task again
    pub async fn republish(&self, task_id: &str) -> ProvisioningResult<PublishOutcome> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Queued {
            return Err(ProvisioningError::conflict(format!(
                "only queued tasks can be republished, task is {}",
                task.status
            )));
        }

        let msg = task_outbox_message(&task, &self.subject, Utc::now())?;
        let outbox_id = self.store.enqueue_outbox(&msg).await?;
        let outcome = self.relay.deliver(outbox_id, &msg.subject, &msg.payload).await;

        tracing::info!("Republished task {} attempt {}: {:?}", task.task_id, task.attempt(), outcome);
        Ok(outcome)
    }

    /// Load, apply, and commit under the task's version. A lost race
    /// reloads the task and applies `apply` again to the fresh copy.
    /// `apply` returning `None` means nothing changed and nothing is written.
    async fn transition<F>(&self, task_id: &str, mut apply: F) -> ProvisioningResult<(ProvisionTask, Option<EventType>)>
    where
        F: FnMut(&mut ProvisionTask, DateTime<Utc>) -> ProvisioningResult<Option<Effects>> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut task = self.get_task(task_id).await?;
            let expected_version = task.version;

            let effects = match apply(&mut task, Utc::now())? {
                Some(effects) => effects,
                None => return Ok((task, None)),
            };

            let write = self
                .store
                .commit_task_transition(
                    &task,
                    expected_version,
                    effects.instance_change.as_ref(),
                    effects.outbox.as_ref(),
                )
                .await?;

            match write {
                TransitionWrite::Stale => {
                    tracing::debug!("Task {} changed underneath us, retrying", task_id);
                    continue;
                }
                TransitionWrite::Applied { outbox_id } => {
                    task.version = expected_version + 1;

                    if let (Some(id), Some(msg)) = (outbox_id, effects.outbox.as_ref()) {
                        self.relay.deliver(id, &msg.subject, &msg.payload).await;
                    }
                    if let Some(hub) = &self.ws_hub {
                        hub.broadcast_task(effects.event, &task).await;
                    }
                    return Ok((task, Some(effects.event)));
                }
            }
        }

        Err(ProvisioningError::conflict(format!(
            "task {} is being updated concurrently, try again",
            task_id
        )))
    }

    async fn require_instance(&self, instance_id: &str) -> ProvisioningResult<TenantInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("Tenant instance", instance_id))
    }

    async fn publish_instance_provisioned(&self, task: &ProvisionTask) {
        let instance = match self.store.get_instance(&task.tenant_instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Could not load instance {} for event: {}", task.tenant_instance_id, e);
                return;
            }
        };

        let event = InstanceProvisionedEvent {
            customer_id: instance.customer_id,
            tenant_instance_id: instance.id,
            tenant_code: instance.tenant_code,
            owner_id: task.initiated_by.clone(),
            occurred_at: Utc::now(),
        };
        self.relay.bus().publish(SUBJECT_INSTANCE_PROVISIONED, &event).await;
    }
}

/// Outbox row carrying the task's current attempt
pub(crate) fn task_outbox_message(
    task: &ProvisionTask,
    subject: &str,
    now: DateTime<Utc>,
) -> ProvisioningResult<NewOutboxMessage> {
    let wire = ProvisioningTaskMessage::for_task(task, now);
    let payload = serde_json::to_string(&wire).map_err(anyhow::Error::from)?;
    Ok(NewOutboxMessage {
        task_id: task.task_id.clone(),
        subject: subject.to_string(),
        payload,
    })
}

/// What a completed task does to its instance
fn completion_change(task: &ProvisionTask) -> ProvisioningResult<Option<InstanceChange>> {
    match task.task_type {
        TaskType::TenantProvision => Ok(Some(InstanceChange::Status(InstanceStatus::Active))),
        TaskType::TenantDeprovision => Ok(Some(InstanceChange::Status(InstanceStatus::Deprovisioned))),
        TaskType::FeatureUpdate => {
            let active = payload_features(task, payload_keys::ACTIVE_FEATURES)?;
            let overrides = payload_features(task, payload_keys::FEATURES)?;
            Ok(Some(InstanceChange::Features { active, overrides }))
        }
        TaskType::InvoiceGeneration => Ok(None),
    }
}

fn payload_features(task: &ProvisionTask, key: &str) -> ProvisioningResult<FeatureMap> {
    let value = task.payload.get(key).cloned().ok_or_else(|| {
        ProvisioningError::Store(anyhow::anyhow!("task {} payload is missing '{}'", task.task_id, key))
    })?;
    serde_json::from_value(value)
        .map_err(|e| ProvisioningError::Store(anyhow::anyhow!("task {} payload '{}': {}", task.task_id, key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_fixtures::*;
    use crate::messaging::testing::*;
    use crate::messaging::MessageBus;

    const SUBJECT: &str = "provisioning.tasks";

    struct Fixture {
        store: Store,
        tracker: TaskTracker,
        broker: Arc<RecordingBroker>,
        task_id: String,
    }

    async fn fixture_with(task_type: TaskType, payload: serde_json::Map<String, serde_json::Value>) -> Fixture {
        let store = seeded_store().await;
        let inst = instance("inst-1", None);
        let task = ProvisionTask::queued(&inst.id, task_type, 5, payload, "user-7", None, Utc::now());
        store.create_provisioning(&inst, &task, &outbox_for(&task)).await.unwrap();

        let (bus, broker) = recording_bus();
        let relay = OutboxRelay::new(store.clone(), bus, 50);
        let tracker = TaskTracker::new(store.clone(), relay, None, SUBJECT);
        Fixture {
            store,
            tracker,
            broker,
            task_id: task.task_id,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(TaskType::TenantProvision, serde_json::Map::new()).await
    }

    #[tokio::test]
    async fn test_completion_activates_instance() {
        let f = fixture().await;
        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
        f.tracker.advance_step(&f.task_id, "create_database", 40).await.unwrap();
        let task = f.tracker.complete(&f.task_id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);

        let inst = f.store.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Active);

        let events = f.broker.messages_on(SUBJECT_INSTANCE_PROVISIONED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["ownerId"], "user-7");
    }

    #[tokio::test]
    async fn test_five_failures_exhaust_retries() {
        let f = fixture().await;

        for attempt in 1..=5 {
            f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
            let task = f.tracker.fail(&f.task_id, "database timeout").await.unwrap();
            assert_eq!(task.retry_count, attempt);
        }

        let task = f.tracker.get_task(&f.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 5);
        assert_eq!(task.error_message.as_deref(), Some("database timeout"));

        let inst = f.store.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Provisioning);

        // Four requeues, each announcing the next attempt
        let attempts: Vec<i64> = f
            .broker
            .messages_on(SUBJECT)
            .iter()
            .map(|m| m["attempt"].as_i64().unwrap())
            .collect();
        assert_eq!(attempts, vec![2, 3, 4, 5]);

        let err = f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_repeated_step_is_not_recounted() {
        let f = fixture().await;
        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
        f.tracker.advance_step(&f.task_id, "create_schema", 30).await.unwrap();
        let before = f.tracker.get_task(&f.task_id).await.unwrap();

        let after = f.tracker.advance_step(&f.task_id, "create_schema", 70).await.unwrap();
        assert_eq!(after.steps_completed, before.steps_completed);
        assert_eq!(after.progress, 30);
        assert_eq!(after.version, before.version);
    }

    #[tokio::test]
    async fn test_progress_out_of_range_is_rejected() {
        let f = fixture().await;
        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
        let err = f.tracker.advance_step(&f.task_id, "x", 101).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_racing_progress_reports_keep_every_step() {
        let f = fixture().await;
        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();

        let (a, b) = tokio::join!(
            f.tracker.advance_step(&f.task_id, "create_schema", 20),
            f.tracker.advance_step(&f.task_id, "seed_data", 50),
        );
        a.unwrap();
        b.unwrap();

        let task = f.tracker.get_task(&f.task_id).await.unwrap();
        assert_eq!(task.steps_completed.as_slice().len(), 2);
        assert_eq!(task.progress, 50);
    }

    #[tokio::test]
    async fn test_cancel_leaves_instance_provisioning() {
        let f = fixture().await;
        f.tracker.cancel(&f.task_id).await.unwrap();

        let inst = f.store.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Provisioning);

        let err = f.tracker.cancel(&f.task_id).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_feature_update_completion_writes_features() {
        let mut payload = serde_json::Map::new();
        payload.insert(payload_keys::FEATURES.to_string(), serde_json::json!({"max_warehouses": 9}));
        payload.insert(
            payload_keys::ACTIVE_FEATURES.to_string(),
            serde_json::json!({"inventory": true, "max_warehouses": 9}),
        );
        let f = fixture_with(TaskType::FeatureUpdate, payload).await;

        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
        f.tracker.complete(&f.task_id).await.unwrap();

        let inst = f.store.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(inst.feature_overrides["max_warehouses"], FeatureValue::Limit(9));
        assert_eq!(inst.active_features["inventory"], FeatureValue::Flag(true));
        assert!(f.broker.messages_on(SUBJECT_INSTANCE_PROVISIONED).is_empty());
    }

    #[tokio::test]
    async fn test_republish_requires_queued_task() {
        let f = fixture().await;
        let outcome = f.tracker.republish(&f.task_id).await.unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(f.broker.messages_on(SUBJECT)[0]["attempt"], 1);
        let history = f.tracker.task_messages(&f.task_id).await.unwrap();
        assert!(history.len() >= 2);
        assert!(history.last().unwrap().delivered_at.is_some());

        f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
        let err = f.tracker.republish(&f.task_id).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_requeue_survives_broker_outage() {
        let store = seeded_store().await;
        let inst = instance("inst-1", None);
        let task = ProvisionTask::queued(
            &inst.id,
            TaskType::TenantProvision,
            5,
            serde_json::Map::new(),
            "user-7",
            None,
            Utc::now(),
        );
        store.create_provisioning(&inst, &task, &outbox_for(&task)).await.unwrap();
        let relay = OutboxRelay::new(store.clone(), Arc::new(MessageBus::disconnected()), 50);
        let tracker = TaskTracker::new(store.clone(), relay, None, SUBJECT);

        tracker.mark_processing(&task.task_id, "worker-1").await.unwrap();
        let requeued = tracker.fail(&task.task_id, "boom").await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);

        let pending = store.list_task_outbox(&task.task_id).await.unwrap();
        let retry = pending.last().unwrap();
        assert!(retry.delivered_at.is_none());
        let wire: ProvisioningTaskMessage = serde_json::from_str(&retry.payload).unwrap();
        assert_eq!(wire.attempt, 2);
    }

    #[tokio::test]
    async fn test_queue_status_counts_and_failures() {
        let f = fixture().await;
        for _ in 0..5 {
            f.tracker.mark_processing(&f.task_id, "worker-1").await.unwrap();
            f.tracker.fail(&f.task_id, "disk full").await.unwrap();
        }

        let status = f.tracker.queue_status("inst-1").await.unwrap();
        assert_eq!(status.failed_tasks, 1);
        assert_eq!(status.queued_tasks, 0);
        assert_eq!(status.recent_failures.len(), 1);
        assert_eq!(status.recent_failures[0].error_message, "disk full");
        assert_eq!(status.recent_failures[0].retry_count, 5);

        let err = f.tracker.queue_status("missing").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::NotFound { .. }));
    }
}
