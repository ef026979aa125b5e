use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use super::{MessageBus, PublishOutcome};
use crate::db::Store;
use crate::models::{OutboxMessage, ProvisioningTaskMessage, TaskStatus};

/// Counts from one relay sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub failed: usize,
    pub discarded: usize,
}

/// Delivers task messages written to the outbox, both right after the
/// owning transaction commits and from a periodic sweep of pending rows.
pub struct OutboxRelay {
    store: Store,
    bus: Arc<MessageBus>,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(store: Store, bus: Arc<MessageBus>, batch_size: i64) -> Arc<Self> {
        Arc::new(Self { store, bus, batch_size })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Publish one committed outbox row and record the result. Never fails;
    /// an undelivered row stays pending for the sweep.
    pub async fn deliver(&self, outbox_id: i64, subject: &str, payload: &str) -> PublishOutcome {
        let outcome = self.bus.publish_raw(subject, payload.as_bytes().to_vec()).await;

        let recorded = match outcome {
            PublishOutcome::Delivered => self.store.mark_outbox_delivered(outbox_id).await,
            PublishOutcome::Degraded => Ok(()),
            PublishOutcome::Failed => self.store.record_outbox_failure(outbox_id, "publish failed").await,
        };
        if let Err(e) = recorded {
            tracing::error!("Failed to record outbox {} delivery state: {}", outbox_id, e);
        }

        outcome
    }

    /// Start the periodic sweep
    pub fn start(self: &Arc<Self>, interval_secs: u64) {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                match relay.sweep().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            "Outbox sweep: {} delivered, {} failed, {} discarded",
                            report.delivered,
                            report.failed,
                            report.discarded
                        );
                    }
                    Err(e) => {
                        tracing::error!("Outbox sweep failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    /// Re-publish pending rows oldest first. Rows that no longer match the
    /// task's current queued attempt are retired instead of sent.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if !self.bus.is_connected() {
            tracing::debug!("Outbox sweep skipped, broker not connected");
            return Ok(report);
        }

        for msg in self.store.list_pending_outbox(self.batch_size).await? {
            if let Some(reason) = self.stale_reason(&msg).await? {
                tracing::info!("Discarding outbox message {} for task {}: {}", msg.id, msg.task_id, reason);
                self.store.discard_outbox(msg.id, &reason).await?;
                report.discarded += 1;
                continue;
            }

            match self.bus.publish_raw(&msg.subject, msg.payload.clone().into_bytes()).await {
                PublishOutcome::Delivered => {
                    self.store.mark_outbox_delivered(msg.id).await?;
                    report.delivered += 1;
                }
                PublishOutcome::Degraded | PublishOutcome::Failed => {
                    self.store.record_outbox_failure(msg.id, "publish failed").await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn stale_reason(&self, msg: &OutboxMessage) -> Result<Option<String>> {
        let task = match self.store.get_task(&msg.task_id).await? {
            Some(t) => t,
            None => return Ok(Some("task no longer exists".to_string())),
        };

        if task.status != TaskStatus::Queued {
            return Ok(Some(format!("task is {}", task.status)));
        }

        match serde_json::from_str::<ProvisioningTaskMessage>(&msg.payload) {
            Ok(wire) if wire.attempt != task.attempt() => Ok(Some(format!(
                "attempt {} superseded by attempt {}",
                wire.attempt,
                task.attempt()
            ))),
            Ok(_) => Ok(None),
            Err(e) => Ok(Some(format!("unreadable payload: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_fixtures::*;
    use crate::db::NewOutboxMessage;
    use crate::messaging::testing::*;
    use crate::models::*;
    use chrono::Utc;

    async fn queued_task(store: &Store) -> (ProvisionTask, i64) {
        let inst = instance("inst-1", None);
        let task = ProvisionTask::queued(
            &inst.id,
            TaskType::TenantProvision,
            5,
            serde_json::Map::new(),
            "tester",
            None,
            Utc::now(),
        );
        let wire = ProvisioningTaskMessage::for_task(&task, Utc::now());
        let outbox = NewOutboxMessage {
            task_id: task.task_id.clone(),
            subject: "provisioning.tasks".to_string(),
            payload: serde_json::to_string(&wire).unwrap(),
        };
        let id = store.create_provisioning(&inst, &task, &outbox).await.unwrap();
        (task, id)
    }

    #[tokio::test]
    async fn test_sweep_publishes_pending_rows() {
        let store = seeded_store().await;
        let (task, _) = queued_task(&store).await;
        let (bus, broker) = recording_bus();
        let relay = OutboxRelay::new(store.clone(), bus, 10);

        let report = relay.sweep().await.unwrap();
        assert_eq!(report, SweepReport { delivered: 1, failed: 0, discarded: 0 });

        let sent = broker.messages_on("provisioning.tasks");
        assert_eq!(sent[0]["taskId"], task.task_id.as_str());
        assert_eq!(sent[0]["attempt"], 1);
        assert!(store.list_pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_stays_pending() {
        let store = seeded_store().await;
        let (_, id) = queued_task(&store).await;
        let relay = OutboxRelay::new(store.clone(), failing_bus(), 10);

        assert_eq!(relay.deliver(id, "provisioning.tasks", "{}").await, PublishOutcome::Failed);
        let report = relay.sweep().await.unwrap();
        assert_eq!(report.failed, 1);

        let pending = store.list_pending_outbox(10).await.unwrap();
        assert_eq!(pending[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_sweep_delivers_after_broker_link_returns() {
        let store = seeded_store().await;
        let (task, id) = queued_task(&store).await;
        let (bus, broker) = flaky_bus(2);
        let relay = OutboxRelay::new(store.clone(), bus, 10);

        assert_eq!(relay.deliver(id, "provisioning.tasks", "{}").await, PublishOutcome::Failed);
        assert_eq!(relay.sweep().await.unwrap().failed, 1);

        let report = relay.sweep().await.unwrap();
        assert_eq!(report, SweepReport { delivered: 1, failed: 0, discarded: 0 });
        assert_eq!(broker.messages_on("provisioning.tasks")[0]["taskId"], task.task_id.as_str());
        assert!(store.list_pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_discards_messages_for_cancelled_task() {
        let store = seeded_store().await;
        let (task, _) = queued_task(&store).await;

        let mut stored = store.get_task(&task.task_id).await.unwrap().unwrap();
        stored.cancel(Utc::now()).unwrap();
        store.commit_task_transition(&stored, stored.version, None, None).await.unwrap();

        let (bus, broker) = recording_bus();
        let relay = OutboxRelay::new(store.clone(), bus, 10);
        let report = relay.sweep().await.unwrap();

        assert_eq!(report.discarded, 1);
        assert!(broker.subjects().is_empty());
        assert!(store.list_pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skipped_while_disconnected() {
        let store = seeded_store().await;
        queued_task(&store).await;
        let relay = OutboxRelay::new(store.clone(), Arc::new(MessageBus::disconnected()), 10);

        assert_eq!(relay.sweep().await.unwrap(), SweepReport::default());
        assert_eq!(store.list_pending_outbox(10).await.unwrap().len(), 1);
    }
}
