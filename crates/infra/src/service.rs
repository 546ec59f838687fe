//! `EventBusService`: one registry shared by the dispatch and processing sides.
//!
//! ```text
//! emit ──▶ EventDispatcher ──┬──▶ DurableQueue ──▶ QueueConsumer ──▶ JobProcessor ──▶ subscribers
//!                            └──▶ BroadcastChannel ──▶ external observers
//! ```

use std::sync::Arc;

use serde_json::Value as JsonValue;

use fanout_core::{EventBusError, SubscriberId};
use fanout_events::{
    BroadcastChannel, DurableQueue, EmitOptions, EmitReceipt, EnvelopeBuilder, Event,
    EventDispatcher, JobProcessor, Subscriber, SubscriberDescriptor, SubscriberRegistry, Topic,
};

use crate::config::BusConfig;
use crate::jobs::{Backoff, ClaimQueue, ConsumerConfig, QueueConsumer};

/// Upper bound for retry delays derived from [`BusConfig::backoff_base`].
const MAX_BACKOFF_FACTOR: u32 = 60;

pub struct EventBusService<Q, B: ?Sized> {
    registry: Arc<SubscriberRegistry>,
    queue: Arc<Q>,
    dispatcher: EventDispatcher<Arc<Q>, B>,
    processor: Arc<JobProcessor<Arc<Q>>>,
}

impl<Q, B> EventBusService<Q, B>
where
    Q: DurableQueue + 'static,
    B: BroadcastChannel + ?Sized + 'static,
{
    pub fn new(queue: Arc<Q>, broadcast: Arc<B>, source_tag: impl Into<String>) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let dispatcher =
            EventDispatcher::new(Arc::clone(&queue), broadcast, EnvelopeBuilder::new(source_tag));
        let processor = Arc::new(JobProcessor::new(Arc::clone(&registry), Arc::clone(&queue)));

        Self {
            registry,
            queue,
            dispatcher,
            processor,
        }
    }

    /// Wire a service with the source tag and job options from `config`.
    pub fn from_config(queue: Arc<Q>, broadcast: Arc<B>, config: &BusConfig) -> Self {
        let mut service = Self::new(queue, broadcast, config.app_name.clone());
        service.dispatcher = service
            .dispatcher
            .with_job_options(config.job_options.clone());
        service
    }

    /// Register `handler` for `topic` (`"*"` for every event).
    ///
    /// Only subscribers with an id are skipped on retries once they have succeeded.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        handler: Arc<dyn Subscriber>,
        id: Option<SubscriberId>,
    ) -> Option<SubscriberId> {
        let descriptor = match id {
            Some(id) => SubscriberDescriptor::with_id(id, handler),
            None => SubscriberDescriptor::new(handler),
        };
        self.registry.register(topic, descriptor)
    }

    pub async fn emit(
        &self,
        event_name: impl Into<String>,
        data: JsonValue,
        options: EmitOptions,
    ) -> Result<EmitReceipt, EventBusError> {
        self.dispatcher.emit(event_name, data, options).await
    }

    pub async fn emit_batch(&self, events: Vec<Event>) -> Result<EmitReceipt, EventBusError> {
        self.dispatcher.emit_batch(events).await
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn processor(&self) -> &Arc<JobProcessor<Arc<Q>>> {
        &self.processor
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }
}

impl<Q, B> EventBusService<Q, B>
where
    Q: DurableQueue + ClaimQueue + 'static,
    B: BroadcastChannel + ?Sized + 'static,
{
    /// A consumer draining this service's queue into its processor.
    pub fn consumer(&self, config: ConsumerConfig) -> QueueConsumer<Q, Arc<Q>> {
        QueueConsumer::new(Arc::clone(&self.queue), Arc::clone(&self.processor), config)
    }
}

/// Consumer settings derived from the bus configuration.
pub fn consumer_config(config: &BusConfig) -> ConsumerConfig {
    let max_delay = config.backoff_base.saturating_mul(MAX_BACKOFF_FACTOR);
    ConsumerConfig::default()
        .with_name(config.queue_key())
        .with_concurrency(config.concurrency)
        .with_backoff(Backoff::exponential(config.backoff_base, max_delay))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::jobs::InMemoryJobQueue;
    use fanout_events::{InMemoryBroadcast, subscriber_fn};

    fn config() -> BusConfig {
        BusConfig::from_lookup(|key: &str| match key {
            "REDIS_HOST" => Some("localhost".into()),
            "REDIS_PORT" => Some("6379".into()),
            "APP_NAME" => Some("billing".into()),
            "EVENT_BUS_JOB_ATTEMPTS" => Some("3".into()),
            "EVENT_BUS_BACKOFF_MS" => Some("250".into()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn from_config_applies_source_tag_and_job_options() {
        let queue = InMemoryJobQueue::arc();
        let service =
            EventBusService::from_config(Arc::clone(&queue), Arc::new(InMemoryBroadcast::new()), &config());

        let receipt = service
            .emit("invoice.paid", json!({"id": 9}), EmitOptions::default())
            .await
            .unwrap();

        let record = queue.get(receipt.job_ids[0]).unwrap();
        assert_eq!(record.max_attempts, 3);
        let envelope = record.data.envelope.unwrap();
        assert_eq!(envelope.source_tag(), Some("billing"));
    }

    #[test]
    fn subscribe_returns_the_id_it_was_given() {
        let service = EventBusService::new(
            InMemoryJobQueue::arc(),
            Arc::new(InMemoryBroadcast::new()),
            "app",
        );
        let handler = subscriber_fn(|_payload, _name| async { Ok(json!(null)) });

        assert_eq!(
            service.subscribe("a", Arc::clone(&handler), Some("audit".into())),
            Some(SubscriberId::from("audit"))
        );
        assert_eq!(service.subscribe("*", handler, None), None);
        assert_eq!(service.registry().resolve("a").len(), 2);
    }

    #[test]
    fn consumer_config_follows_bus_config() {
        let cfg = consumer_config(&config());
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.name, "EventBusService:events-queue");
        assert_eq!(cfg.backoff.delay_for(1), Duration::from_millis(250));
    }
}
