//! In-process broadcast channel backed by `tokio::sync::broadcast`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use fanout_core::EventBusError;

use crate::bus::{BroadcastChannel, BroadcastMessage};
use crate::subscriber::Topic;

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A message together with the topic it was published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub message: BroadcastMessage,
}

/// In-memory pub/sub bus for tests/dev and single-process deployments.
///
/// - Best-effort fan-out: publishing with no receivers silently drops
/// - Slow receivers lag and lose the oldest messages
#[derive(Debug)]
pub struct InMemoryBroadcast {
    sender: broadcast::Sender<Published>,
    published: AtomicU64,
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A capacity of 0 is raised to 1.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to messages on `topic` (`"*"` receives everything).
    pub fn subscribe(&self, topic: impl Into<Topic>) -> BroadcastSubscription {
        BroadcastSubscription {
            receiver: self.sender.subscribe(),
            topic: topic.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total publish calls, including ones that had no receivers.
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastChannel for InMemoryBroadcast {
    async fn publish(&self, topic: &str, message: &BroadcastMessage) -> Result<(), EventBusError> {
        self.published.fetch_add(1, Ordering::Relaxed);

        let published = Published {
            topic: topic.to_string(),
            message: message.clone(),
        };

        // A send error only means there are zero receivers.
        match self.sender.send(published) {
            Ok(receivers) => debug!(topic, receivers, "broadcast published"),
            Err(_) => debug!(topic, "broadcast dropped (no receivers)"),
        }

        Ok(())
    }
}

/// Receiving half of an [`InMemoryBroadcast`] subscription.
#[derive(Debug)]
pub struct BroadcastSubscription {
    receiver: broadcast::Receiver<Published>,
    topic: Topic,
}

impl BroadcastSubscription {
    /// Next message matching the subscribed topic; `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Published> {
        loop {
            match self.receiver.recv().await {
                Ok(p) if self.matches(&p) => return Some(p),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, topic = %self.topic, "broadcast subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive. `Ok(None)` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Result<Option<Published>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(p) if self.matches(&p) => return Ok(Some(p)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::connection("broadcast bus closed"));
                }
            }
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    fn matches(&self, published: &Published) -> bool {
        match &self.topic {
            Topic::Wildcard => true,
            Topic::Named(name) => name == &published.topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::envelope::EnvelopeBuilder;

    fn message(name: &str) -> BroadcastMessage {
        let envelope = EnvelopeBuilder::new("test").build(name, &BTreeMap::new());
        BroadcastMessage::new(envelope, json!({"name": name}))
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let bus = InMemoryBroadcast::new();
        bus.publish("orphan.event", &message("orphan.event"))
            .await
            .unwrap();
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn zero_capacity_still_delivers() {
        let bus = InMemoryBroadcast::with_capacity(0);
        let mut sub = bus.subscribe("tick");

        bus.publish("tick", &message("tick")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().topic, "tick");
    }

    #[tokio::test]
    async fn topic_subscription_filters_other_topics() {
        let bus = InMemoryBroadcast::new();
        let mut orders = bus.subscribe("order.created");
        let mut everything = bus.subscribe("*");

        bus.publish("user.created", &message("user.created")).await.unwrap();
        bus.publish("order.created", &message("order.created")).await.unwrap();

        let got = orders.recv().await.unwrap();
        assert_eq!(got.topic, "order.created");
        assert!(orders.try_recv().unwrap().is_none());

        assert_eq!(everything.recv().await.unwrap().topic, "user.created");
        assert_eq!(everything.recv().await.unwrap().topic, "order.created");
    }

    #[tokio::test]
    async fn subscription_ends_when_bus_is_dropped() {
        let bus = InMemoryBroadcast::new();
        let mut sub = bus.subscribe("*");
        assert_eq!(bus.subscriber_count(), 1);

        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
