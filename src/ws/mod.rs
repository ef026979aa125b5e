use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::models::{ProvisionTask, TaskStatus, TaskType};

/// Event types for WebSocket messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskQueued,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskRequeued,
    TaskCancelled,
}

/// WebSocket event message
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// Snapshot of a task carried by every task event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventPayload {
    pub task_id: String,
    pub tenant_instance_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&ProvisionTask> for TaskEventPayload {
    fn from(task: &ProvisionTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            tenant_instance_id: task.tenant_instance_id.clone(),
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            current_step: task.current_step.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            error_message: task.error_message.clone(),
        }
    }
}

/// WebSocket hub manages connections and broadcasts events
pub struct Hub {
    tx: broadcast::Sender<String>,
    client_count: Arc<RwLock<usize>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            client_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Broadcast an event to all connected clients
    pub async fn broadcast_event(&self, event: Event) {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Error serializing WebSocket event: {}", e);
                return;
            }
        };

        let count = *self.client_count.read().await;
        if count > 0 {
            if let Err(e) = self.tx.send(data) {
                tracing::warn!("Error broadcasting WebSocket event: {}", e);
            } else {
                tracing::debug!("Broadcasting {:?} to {} clients", event.event_type, count);
            }
        }
    }

    /// Broadcast a task lifecycle event
    pub async fn broadcast_task(&self, event_type: EventType, task: &ProvisionTask) {
        self.broadcast_event(Event {
            event_type,
            payload: serde_json::to_value(TaskEventPayload::from(task)).unwrap_or_default(),
        })
        .await;
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    async fn increment_clients(&self) {
        let mut count = self.client_count.write().await;
        *count += 1;
        tracing::info!("WebSocket client connected. Total clients: {}", *count);
    }

    async fn decrement_clients(&self) {
        let mut count = self.client_count.write().await;
        *count = count.saturating_sub(1);
        tracing::info!("WebSocket client disconnected. Total clients: {}", *count);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket handler for axum
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    hub.increment_clients().await;

    let mut rx = hub.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are only drained to notice disconnects
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    hub.decrement_clients().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_event_reaches_subscriber() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        hub.increment_clients().await;

        let task = ProvisionTask::queued(
            "inst-1",
            TaskType::TenantProvision,
            5,
            serde_json::Map::new(),
            "tester",
            None,
            chrono::Utc::now(),
        );
        hub.broadcast_task(EventType::TaskQueued, &task).await;

        let raw = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "task_queued");
        assert_eq!(json["payload"]["taskId"], task.task_id.as_str());
        assert_eq!(json["payload"]["status"], "queued");
    }

    #[tokio::test]
    async fn test_no_broadcast_without_clients() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        let task = ProvisionTask::queued(
            "inst-1",
            TaskType::FeatureUpdate,
            5,
            serde_json::Map::new(),
            "tester",
            None,
            chrono::Utc::now(),
        );
        hub.broadcast_task(EventType::TaskQueued, &task).await;
        assert!(rx.try_recv().is_err());
    }
}
