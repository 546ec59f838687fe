//! Retry-aware job processing.
//!
//! One call to [`JobProcessor::process`] handles exactly one delivery attempt of a
//! [`JobRecord`]:
//!
//! ```text
//! PENDING ──> RUNNING ──┬──> RESOLVED          (all succeeded, or retries exhausted/disabled)
//!                       └──> RETRY_REQUESTED   (someone failed, retries left)
//! ```
//!
//! - Subscribers whose id is already in the record's completed-set are skipped;
//!   subscribers without an id run on every attempt.
//! - Pending subscribers run concurrently, each on its own task. A failing or
//!   panicking subscriber never cancels its siblings; every outcome is collected.
//! - Before a retry is requested, the merged completed-set and the advanced attempt
//!   counter are persisted through [`DurableQueue::update`].
//! - The final attempt (`attempt == max_attempts`) never requests a retry.
//!
//! Backoff timing and acknowledgement stay with the queue adapter; it interprets
//! the returned [`AttemptOutcome`].

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use fanout_core::{EventBusError, SubscriberError, SubscriberId};

use crate::bus::DurableQueue;
use crate::job::JobRecord;
use crate::registry::SubscriberRegistry;
use crate::subscriber::SubscriberDescriptor;

/// Result of one subscriber invocation within an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberOutcome {
    pub subscriber_id: Option<SubscriberId>,
    pub result: Result<JsonValue, SubscriberError>,
}

impl SubscriberOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// What the queue adapter should do with the attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Acknowledge the job. Outcomes may still contain unrecovered failures.
    Resolved(Vec<SubscriberOutcome>),
    /// Reschedule the job; the record is already persisted with its progress.
    RetryRequested(JobRecord),
    /// The record's attempt counters are inconsistent; nothing was dispatched.
    ConfigurationFailure(String),
}

impl AttemptOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AttemptOutcome::Resolved(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, AttemptOutcome::RetryRequested(_))
    }
}

/// Consumes job records and invokes subscribers.
pub struct JobProcessor<Q> {
    registry: Arc<SubscriberRegistry>,
    queue: Q,
}

impl<Q: DurableQueue> JobProcessor<Q> {
    pub fn new(registry: Arc<SubscriberRegistry>, queue: Q) -> Self {
        Self { registry, queue }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Subscribers that still have to run for this record, in resolution order.
    pub fn pending_subscribers(&self, record: &JobRecord) -> Vec<SubscriberDescriptor> {
        self.registry
            .resolve(record.event_name())
            .into_iter()
            .filter(|d| d.id().is_none_or(|id| !record.has_completed(id)))
            .collect()
    }

    /// Run one delivery attempt.
    ///
    /// `Err` is returned only when persisting retry progress fails.
    #[instrument(
        skip(self, record),
        fields(job_id = %record.id, event_name = %record.event_name(), attempt = record.attempt),
        err
    )]
    pub async fn process(&self, mut record: JobRecord) -> Result<AttemptOutcome, EventBusError> {
        if let Some(reason) = inconsistent_counters(&record) {
            warn!(
                max_attempts = record.max_attempts,
                reason = %reason,
                "refusing to process job record"
            );
            return Ok(AttemptOutcome::ConfigurationFailure(reason));
        }

        let event_name = record.event_name().to_string();
        let is_final = record.is_final_attempt();
        let pending = self.pending_subscribers(&record);

        if record.is_retry() {
            if is_final {
                info!(event_name = %event_name, "final retry attempt");
            }
            info!(
                event_name = %event_name,
                subscribers = self.registry.subscriber_count(&event_name),
                pending = pending.len(),
                "retrying event"
            );
        } else {
            info!(
                event_name = %event_name,
                subscribers = self.registry.subscriber_count(&event_name),
                "processing event"
            );
        }

        let outcomes = dispatch(pending, &record.data.data, &event_name).await;

        let dispatched = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let any_failed = succeeded != dispatched;

        if any_failed && record.max_attempts > 1 && !is_final {
            let completed_now: Vec<SubscriberId> = outcomes
                .iter()
                .filter(|o| o.is_success())
                .filter_map(|o| o.subscriber_id.clone())
                .collect();

            record.merge_completed(completed_now);
            record.advance_attempt();
            self.queue.update(&record).await?;

            warn!(
                event_name = %event_name,
                failed = dispatched - succeeded,
                next_attempt = record.attempt,
                "one or more subscribers failed, retrying"
            );
            return Ok(AttemptOutcome::RetryRequested(record));
        }

        if any_failed && record.max_attempts == 1 {
            warn!(
                event_name = %event_name,
                failed = dispatched - succeeded,
                "one or more subscribers failed, retrying is not configured; set attempts when emitting"
            );
        }

        Ok(AttemptOutcome::Resolved(outcomes))
    }
}

fn inconsistent_counters(record: &JobRecord) -> Option<String> {
    if record.max_attempts == 0 {
        return Some("max_attempts must be at least 1".to_string());
    }
    if record.attempt == 0 {
        return Some("attempt numbering is 1-indexed, got 0".to_string());
    }
    if record.attempt > record.max_attempts {
        return Some(format!(
            "attempt {} exceeds max_attempts {}",
            record.attempt, record.max_attempts
        ));
    }
    None
}

/// Fan out to every pending subscriber, then fan in all outcomes in input order.
async fn dispatch(
    pending: Vec<SubscriberDescriptor>,
    payload: &JsonValue,
    event_name: &str,
) -> Vec<SubscriberOutcome> {
    let payload = Arc::new(payload.clone());
    let event_name: Arc<str> = Arc::from(event_name);

    let handles: Vec<_> = pending
        .into_iter()
        .map(|descriptor| {
            let payload = Arc::clone(&payload);
            let event_name = Arc::clone(&event_name);
            let id = descriptor.id().cloned();
            let handle = tokio::spawn(async move {
                descriptor.handler().invoke(&payload, &event_name).await
            });
            (id, handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (subscriber_id, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(SubscriberError::new("subscriber panicked")),
            Err(e) => Err(SubscriberError::new(format!("subscriber task failed: {e}"))),
        };

        if let Err(error) = &result {
            warn!(
                event_name = %event_name,
                subscriber_id = subscriber_id.as_ref().map(SubscriberId::as_str),
                error = %error,
                "subscriber failed"
            );
        }

        outcomes.push(SubscriberOutcome {
            subscriber_id,
            result,
        });
    }

    outcomes
}
