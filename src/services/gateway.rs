//! Fan-out of progress-channel payloads to gateway connections.
//!
//! Delivery is best effort with no replay: a connection only sees payloads
//! published while it is subscribed, and a lagging connection skips ahead.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::services::store::Published;

const HUB_CAPACITY: usize = 256;

/// In-process broadcast of raw channel payloads.
#[derive(Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<Arc<str>>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Returns the number of connections the payload was handed to.
    pub fn publish(&self, payload: &str) -> usize {
        self.tx.send(Arc::from(payload)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Forward Redis pub/sub messages on `channel` into `hub` until `shutdown`
/// fires, resubscribing after `retry_delay` whenever the subscription drops.
pub fn spawn_redis_forwarder(
    client: redis::Client,
    channel: String,
    hub: ProgressHub,
    retry_delay: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = forward_redis(&client, &channel, &hub) => match result {
                    Ok(()) => warn!(channel = %channel, "Progress subscription ended"),
                    Err(e) => warn!(channel = %channel, error = %e, "Progress subscription failed"),
                },
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    })
}

async fn forward_redis(
    client: &redis::Client,
    channel: &str,
    hub: &ProgressHub,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel = %channel, "Subscribed to progress channel");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        match message.get_payload::<String>() {
            Ok(payload) => {
                hub.publish(&payload);
            }
            Err(e) => warn!(error = %e, "Dropping undecodable progress message"),
        }
    }
    Ok(())
}

/// Forward publishes of an in-process store on `channel` into `hub`.
pub fn spawn_memory_forwarder(
    mut published: broadcast::Receiver<Published>,
    channel: String,
    hub: ProgressHub,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match published.recv().await {
                Ok(message) if message.channel == channel => {
                    hub.publish(&message.payload);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Progress forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{JobStore, MemoryJobStore};

    #[tokio::test]
    async fn test_hub_without_subscribers_drops_payload() {
        let hub = ProgressHub::new();
        assert_eq!(hub.publish("[]"), 0);

        let mut rx = hub.subscribe();
        assert_eq!(hub.publish("[1]"), 1);
        assert_eq!(&*rx.recv().await.unwrap(), "[1]");
    }

    #[tokio::test]
    async fn test_memory_forwarder_filters_channel() {
        let store = MemoryJobStore::new();
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe();
        let task = spawn_memory_forwarder(store.subscribe(), "import:progress".to_string(), hub);

        store.publish("other", "ignored").await.unwrap();
        store.publish("import:progress", "[]").await.unwrap();

        assert_eq!(&*rx.recv().await.unwrap(), "[]");
        task.abort();
    }
}
