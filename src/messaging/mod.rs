pub mod outbox;
pub mod redis_broker;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

pub use outbox::{OutboxRelay, SweepReport};
pub use redis_broker::RedisBroker;

/// Transport that moves a serialized message onto a broker subject
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Whether a broker was reachable when the service started
#[derive(Clone)]
pub enum BrokerConnection {
    Connected(Arc<dyn BrokerClient>),
    Disconnected,
}

/// What happened to one publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// No broker; the message was not sent
    Degraded,
    /// The broker rejected the message or the send errored
    Failed,
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered)
    }
}

/// Publishes messages without ever failing the caller. Delivery problems
/// are logged and reported as a `PublishOutcome`.
pub struct MessageBus {
    connection: BrokerConnection,
}

impl MessageBus {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    pub fn disconnected() -> Self {
        Self::new(BrokerConnection::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, BrokerConnection::Connected(_))
    }

    /// Serialize `message` as JSON and publish it on `subject`
    pub async fn publish<T: Serialize>(&self, subject: &str, message: &T) -> PublishOutcome {
        match serde_json::to_vec(message) {
            Ok(payload) => self.publish_raw(subject, payload).await,
            Err(e) => {
                tracing::error!("Failed to serialize message for {}: {}", subject, e);
                PublishOutcome::Failed
            }
        }
    }

    /// Publish an already-serialized payload
    pub async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> PublishOutcome {
        let client = match &self.connection {
            BrokerConnection::Connected(client) => client,
            BrokerConnection::Disconnected => {
                tracing::warn!("Broker not connected, message to {} not sent (degraded mode)", subject);
                return PublishOutcome::Degraded;
            }
        };

        match client.publish(subject, payload).await {
            Ok(()) => {
                tracing::debug!("Published message to {}", subject);
                PublishOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!("Failed to publish message to {}: {:#}", subject, e);
                PublishOutcome::Failed
            }
        }
    }
}
