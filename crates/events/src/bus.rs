//! Adapter boundaries consumed by the dispatch path and the processor.
//!
//! The event bus has two independently delivered channels:
//!
//! ```text
//! emit ─┬─> DurableQueue (enqueue_bulk, atomic) ──> worker ──> JobProcessor ──> subscribers
//!       └─> BroadcastChannel (publish, best-effort) ──> external observers
//! ```
//!
//! ## Durable queue
//!
//! - `enqueue_bulk` is all-or-nothing: a failure leaves none of the batch visible
//! - redelivery, backoff timing and acknowledgement belong to the adapter
//! - at most one processor handles a given record's current attempt
//!
//! ## Broadcast channel
//!
//! - non-durable pub/sub; a publish failure never affects the durable path
//! - no ordering guarantees across events
//!
//! Neither channel is transactional with the other. Both are at-least-once, so
//! consumers must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fanout_core::{EventBusError, JobId};

use crate::envelope::Envelope;
use crate::job::JobRecord;

/// Persistent, retryable work queue.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Atomically enqueue every record, returning their ids in input order.
    async fn enqueue_bulk(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, EventBusError>;

    /// Persist progress on a record (completed-set, attempt counter).
    async fn update(&self, record: &JobRecord) -> Result<(), EventBusError>;
}

#[async_trait]
impl<Q> DurableQueue for Arc<Q>
where
    Q: DurableQueue + ?Sized,
{
    async fn enqueue_bulk(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, EventBusError> {
        (**self).enqueue_bulk(records).await
    }

    async fn update(&self, record: &JobRecord) -> Result<(), EventBusError> {
        (**self).update(record).await
    }
}

/// Message published on the broadcast channel.
///
/// Wire shape: `{"headers": {..envelope..}, "timestamp": "<epoch ms>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub headers: Envelope,
    pub timestamp: String,
    pub data: JsonValue,
}

impl BroadcastMessage {
    pub fn new(envelope: Envelope, data: JsonValue) -> Self {
        let timestamp = envelope.timestamp().unwrap_or_default().to_string();
        Self {
            headers: envelope,
            timestamp,
            data,
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.headers.event_name()
    }
}

/// Best-effort pub/sub transport.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn publish(&self, topic: &str, message: &BroadcastMessage) -> Result<(), EventBusError>;
}

#[async_trait]
impl<B> BroadcastChannel for Arc<B>
where
    B: BroadcastChannel + ?Sized,
{
    async fn publish(&self, topic: &str, message: &BroadcastMessage) -> Result<(), EventBusError> {
        (**self).publish(topic, message).await
    }
}
