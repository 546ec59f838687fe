//! Redis pub/sub broadcast channel.
//!
//! Note: Redis pub/sub is not durable (messages are dropped when nobody is
//! subscribed). Delivery to subscribers goes through the durable job queue;
//! this channel only notifies external observers.

use std::thread;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use fanout_core::EventBusError;
use fanout_events::{BroadcastChannel, BroadcastMessage, Published, Topic};

use super::{RedisBusError, with_connection};

/// Publishes each event on the channel `<prefix><event name>`.
#[derive(Debug, Clone)]
pub struct RedisBroadcast {
    client: redis::Client,
    channel_prefix: String,
}

impl RedisBroadcast {
    pub fn new(
        redis_url: impl AsRef<str>,
        channel_prefix: impl Into<String>,
    ) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            channel_prefix: channel_prefix.into(),
        })
    }

    pub fn channel_for(&self, topic: &str) -> String {
        format!("{}{}", self.channel_prefix, topic)
    }

    /// Receive messages published on `topic` (`"*"` pattern-subscribes to all).
    ///
    /// A background thread owns the pub/sub connection and forwards decoded
    /// messages until the returned subscription is dropped.
    pub fn subscribe(&self, topic: impl Into<Topic>) -> RedisSubscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let prefix = self.channel_prefix.clone();
        let topic = topic.into();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            let subscribed = match &topic {
                Topic::Wildcard => pubsub.psubscribe(format!("{prefix}*")),
                Topic::Named(name) => pubsub.subscribe(format!("{prefix}{name}")),
            };
            if let Err(e) = subscribed {
                warn!(topic = %topic, error = %e, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let message: BroadcastMessage = match serde_json::from_str(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable broadcast payload");
                        continue;
                    }
                };

                let channel = msg.get_channel_name();
                let published = Published {
                    topic: channel.strip_prefix(&prefix).unwrap_or(channel).to_string(),
                    message,
                };

                if tx.send(published).is_err() {
                    return;
                }
            }
        });

        RedisSubscription { receiver: rx }
    }
}

#[async_trait]
impl BroadcastChannel for RedisBroadcast {
    #[instrument(skip(self, message), fields(channel = %self.channel_for(topic)), err)]
    async fn publish(&self, topic: &str, message: &BroadcastMessage) -> Result<(), EventBusError> {
        let payload = serde_json::to_string(message).map_err(RedisBusError::from)?;
        let channel = self.channel_for(topic);

        let receivers: i64 = with_connection(&self.client, "PUBLISH", move |conn| {
            redis::cmd("PUBLISH").arg(&channel).arg(&payload).query(conn)
        })
        .await?;

        debug!(receivers, "broadcast published");
        Ok(())
    }
}

/// Receiving side of a [`RedisBroadcast::subscribe`] call.
#[derive(Debug)]
pub struct RedisSubscription {
    receiver: mpsc::UnboundedReceiver<Published>,
}

impl RedisSubscription {
    /// Next message; `None` once the background connection has closed.
    pub async fn recv(&mut self) -> Option<Published> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Published> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_prefixed_event_names() {
        let bus = RedisBroadcast::new("redis://127.0.0.1:6379", "events:").unwrap();
        assert_eq!(bus.channel_for("order.created"), "events:order.created");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisBroadcast::new("not a url", "").unwrap_err();
        assert!(matches!(err, RedisBusError::Connection(_)));
    }
}
