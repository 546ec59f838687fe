//! Broker-backed transports.
//!
//! - `redis_pubsub`: the broadcast channel over PUBLISH/SUBSCRIBE (feature `redis`, not durable)
//! - `redis_queue`: the durable job queue over a hash, a ready list and a delayed set (feature `redis`)
//! - `kafka`: the broadcast channel over a Kafka producer (feature `kafka`)
//!
//! The Redis transports use the blocking client on tokio's blocking pool, one connection per call.

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "redis")]
pub mod redis_pubsub;
#[cfg(feature = "redis")]
pub mod redis_queue;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroadcast;
#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBroadcast, RedisSubscription};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;

use fanout_core::EventBusError;

use crate::jobs::JobQueueError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedisBusError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for RedisBusError {
    fn from(value: serde_json::Error) -> Self {
        RedisBusError::Serialization(value.to_string())
    }
}

impl From<RedisBusError> for EventBusError {
    fn from(value: RedisBusError) -> Self {
        match value {
            RedisBusError::Connection(msg) => EventBusError::connection(msg),
            RedisBusError::Serialization(msg) => EventBusError::serialization(msg),
            other => EventBusError::delivery(other.to_string()),
        }
    }
}

impl From<RedisBusError> for JobQueueError {
    fn from(value: RedisBusError) -> Self {
        match value {
            RedisBusError::Connection(msg) => JobQueueError::Connection(msg),
            RedisBusError::Serialization(msg) => JobQueueError::Serialization(msg),
            other => JobQueueError::Storage(other.to_string()),
        }
    }
}

/// Run `f` against a fresh blocking connection on the blocking pool.
#[cfg(feature = "redis")]
pub(crate) async fn with_connection<T, F>(
    client: &redis::Client,
    operation: &'static str,
    f: F,
) -> Result<T, RedisBusError>
where
    T: Send + 'static,
    F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
{
    let client = client.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = client
            .get_connection()
            .map_err(|e| RedisBusError::Connection(e.to_string()))?;
        f(&mut conn).map_err(|e| RedisBusError::Command(format!("{operation} failed: {e}")))
    })
    .await
    .map_err(|e| RedisBusError::Task(e.to_string()))?
}
