//! Cross-instance bridge.
//!
//! Locally-originated events are published on a single well-known pub/sub
//! topic; a subscriber task replays remote events into local fan-out.  The
//! subscriber is a small state machine: Connecting (bounded exponential
//! backoff, instance fully functional locally), Subscribed, Draining on
//! shutdown.  There is no protocol-level dedup -- handlers are idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::Envelope;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::hub::HubHandle;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// A live subscription.  `recv` yields raw frame payloads; `None` means the
/// underlying connection ended and the caller should resubscribe.
pub struct BusSubscription {
    rx: mpsc::Receiver<String>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// The pub/sub transport seam.  Production uses Redis; tests wire two hub
/// instances to an in-process loopback bus.
#[async_trait]
pub trait PubSubBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;
}

// ---------------------------------------------------------------------------
// Redis bus
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(RedisBus { client, publisher })
    }
}

#[async_trait]
impl PubSubBus for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            // Stream end: the pub/sub connection died; dropping `tx` lets
            // the subscriber loop observe it and reconnect.
        });
        Ok(BusSubscription { rx })
    }
}

// ---------------------------------------------------------------------------
// Loopback bus (tests, single-node development)
// ---------------------------------------------------------------------------

/// In-process bus with the same semantics as a Redis topic: every
/// subscriber -- including ones on the publishing instance -- sees every
/// frame, in publish order.
#[derive(Default)]
pub struct LoopbackBus {
    topics: std::sync::Mutex<std::collections::HashMap<String, tokio::sync::broadcast::Sender<String>>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> tokio::sync::broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| tokio::sync::broadcast::channel(1024).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBus for LoopbackBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not an error, matching Redis PUBLISH.
        let _ = self.sender_for(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut broadcast_rx = self.sender_for(topic).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusSubscription { rx })
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    bus: Arc<dyn PubSubBus>,
    topic: String,
}

impl Bridge {
    pub fn new(bus: Arc<dyn PubSubBus>, topic: impl Into<String>) -> Self {
        Bridge {
            bus,
            topic: topic.into(),
        }
    }

    /// Publish a locally-originated envelope.  A bus outage degrades the
    /// fleet to per-instance correctness, so failures log and continue --
    /// the durable stream has the event either way.
    pub async fn publish(&self, envelope: &Envelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize envelope for bridge publish");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.topic, payload).await {
            warn!(error = %e, "bridge publish failed");
        }
    }

    /// Run the subscriber until shutdown.  Remote envelopes are replayed
    /// into the hub through the remote path (no persist, no re-publish).
    pub fn spawn_subscriber(
        self: Arc<Self>,
        hub: HubHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = self;
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut sub = match bridge.bus.subscribe(&bridge.topic).await {
                    Ok(sub) => {
                        info!(topic = %bridge.topic, "bridge subscribed");
                        backoff = BACKOFF_INITIAL;
                        sub
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "bridge connect failed");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        continue;
                    }
                };

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                // Draining: stop consuming; in-flight
                                // handlers were awaited inline above.
                                info!("bridge draining");
                                return;
                            }
                        }
                        frame = sub.recv() => {
                            let Some(frame) = frame else {
                                warn!("bridge subscription ended, reconnecting");
                                break;
                            };
                            match serde_json::from_str::<Envelope>(&frame) {
                                Ok(envelope) => hub.broadcast_remote(envelope).await,
                                Err(e) => debug!(error = %e, "dropping undecodable bridge frame"),
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_bus_delivers_to_all_subscribers_in_order() {
        let bus = LoopbackBus::new();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();
        bus.publish("t", "one".to_owned()).await.unwrap();
        bus.publish("t", "two".to_owned()).await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("one"));
        assert_eq!(a.recv().await.as_deref(), Some("two"));
        assert_eq!(b.recv().await.as_deref(), Some("one"));
        assert_eq!(b.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn loopback_publish_without_subscribers_is_ok() {
        let bus = LoopbackBus::new();
        assert!(bus.publish("empty", "x".to_owned()).await.is_ok());
    }
}
