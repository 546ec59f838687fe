//! Emission pipeline: durable enqueue plus best-effort broadcast.
//!
//! ```text
//! emit(batch)
//!   ↓
//! 1. Layer options (defaults < process-wide job options < per-call options)
//!   ↓
//! 2. Build one envelope and one JobRecord per event (attempt = 1, empty completed-set)
//!   ↓
//! 3. DurableQueue::enqueue_bulk (single, all-or-nothing)  -- failure propagates
//!   ↓
//! 4. BroadcastChannel::publish per event, concurrently    -- failures logged and swallowed
//! ```
//!
//! The enqueue runs first so a rejected batch is never announced to observers.
//! The two channels stay independent: broadcast failures never touch the durable
//! records, and there is no rollback between them.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use fanout_core::{EventBusError, JobId};

use crate::bus::{BroadcastChannel, BroadcastMessage, DurableQueue};
use crate::envelope::EnvelopeBuilder;
use crate::event::Event;
use crate::job::JobRecord;
use crate::options::EmitOptions;

/// Result of a successful emission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitReceipt {
    /// Ids of the enqueued job records, in input order.
    pub job_ids: Vec<JobId>,
    /// Broadcast publications that failed (already logged).
    pub broadcast_failures: Vec<BroadcastFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFailure {
    pub event_name: String,
    pub error: EventBusError,
}

/// Turns emit calls into durable job records plus broadcast publications.
pub struct EventDispatcher<Q, B: ?Sized> {
    queue: Q,
    broadcast: Arc<B>,
    envelopes: EnvelopeBuilder,
    job_options: EmitOptions,
}

impl<Q, B> EventDispatcher<Q, B>
where
    Q: DurableQueue,
    B: BroadcastChannel + ?Sized + 'static,
{
    pub fn new(queue: Q, broadcast: Arc<B>, envelopes: EnvelopeBuilder) -> Self {
        Self {
            queue,
            broadcast,
            envelopes,
            job_options: EmitOptions::default(),
        }
    }

    /// Process-wide options layered between the built-in defaults and per-call options.
    pub fn with_job_options(mut self, options: EmitOptions) -> Self {
        self.job_options = options;
        self
    }

    pub fn job_options(&self) -> &EmitOptions {
        &self.job_options
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Emit a single event.
    pub async fn emit(
        &self,
        event_name: impl Into<String>,
        data: JsonValue,
        options: EmitOptions,
    ) -> Result<EmitReceipt, EventBusError> {
        self.emit_batch(vec![Event::new(event_name, data).with_options(options)])
            .await
    }

    /// Emit a batch of events.
    ///
    /// Either every record of the batch is enqueued or the error is returned and
    /// nothing is broadcast.
    #[instrument(skip(self, events), fields(batch_size = events.len()), err)]
    pub async fn emit_batch(&self, events: Vec<Event>) -> Result<EmitReceipt, EventBusError> {
        if events.is_empty() {
            return Ok(EmitReceipt::default());
        }

        let mut records = Vec::with_capacity(events.len());
        let mut messages = Vec::with_capacity(events.len());

        for event in events {
            let options = EmitOptions::defaults()
                .layer(&self.job_options)
                .layer(&event.options);

            if options.effective_attempts() == 0 {
                return Err(EventBusError::configuration(format!(
                    "event {}: attempts must be at least 1",
                    event.event_name
                )));
            }

            let envelope = self.envelopes.build(&event.event_name, &options.headers);
            messages.push((
                event.event_name.clone(),
                BroadcastMessage::new(envelope.clone(), event.data.clone()),
            ));
            records.push(JobRecord::new(
                event.event_name,
                event.data,
                Some(envelope),
                &options,
            ));
        }

        let job_ids = self.queue.enqueue_bulk(records).await?;
        debug!(count = job_ids.len(), "job records enqueued");

        let broadcast_failures = self.publish_all(messages).await;

        Ok(EmitReceipt {
            job_ids,
            broadcast_failures,
        })
    }

    async fn publish_all(&self, messages: Vec<(String, BroadcastMessage)>) -> Vec<BroadcastFailure> {
        let mut set = JoinSet::new();
        for (event_name, message) in messages {
            let broadcast = Arc::clone(&self.broadcast);
            set.spawn(async move {
                let result = broadcast.publish(&event_name, &message).await;
                (event_name, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (event_name, error) = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((event_name, Err(e))) => (event_name, e),
                Err(e) => (
                    String::new(),
                    EventBusError::delivery(format!("broadcast task failed: {e}")),
                ),
            };
            error!(event_name = %event_name, error = %error, "broadcast publish failed");
            failures.push(BroadcastFailure { event_name, error });
        }

        failures
    }
}
