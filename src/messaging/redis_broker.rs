use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::BrokerClient;

/// Redis pub/sub transport; subjects map to channels.
///
/// Holds a `ConnectionManager`, which re-establishes the socket after the
/// server restarts or the link drops, so the outbox sweep can deliver again.
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Open a managed connection, giving up on the first connect after `timeout`
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid broker URL")?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .context("Timed out connecting to broker")?
            .context("Failed to connect to broker")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl BrokerClient for RedisBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(subject, payload)
            .await
            .with_context(|| format!("PUBLISH to {} failed", subject))?;
        tracing::debug!("{} subscriber(s) received message on {}", receivers, subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_broker_fails_to_connect() {
        let result = RedisBroker::connect("redis://127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = RedisBroker::connect("not a url", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    /// Needs a live server: `REDIS_TEST_URL=redis://127.0.0.1:6379 cargo test`
    #[tokio::test]
    async fn test_publish_recovers_after_connection_killed() {
        let Ok(url) = std::env::var("REDIS_TEST_URL") else {
            return;
        };
        let broker = RedisBroker::connect(&url, Duration::from_secs(2)).await.unwrap();
        broker.publish("orchestrator.test", b"before".to_vec()).await.unwrap();

        // Drop every client connection except the admin one issuing the kill
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut admin = client.get_multiplexed_async_connection().await.unwrap();
        let _: i64 = redis::cmd("CLIENT")
            .arg("KILL")
            .arg("TYPE")
            .arg("normal")
            .arg("SKIPME")
            .arg("yes")
            .query_async(&mut admin)
            .await
            .unwrap();

        let mut delivered = false;
        for _ in 0..20 {
            if broker.publish("orchestrator.test", b"after".to_vec()).await.is_ok() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(delivered);
    }
}
