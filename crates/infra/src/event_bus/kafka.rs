//! Kafka broadcast channel (feature `kafka`).
//!
//! Each event is produced to the topic named after the event. The envelope
//! travels as Kafka headers and the payload as the JSON value. The envelope
//! timestamp is the record key and, when parseable, the record timestamp.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::{debug, instrument};

use fanout_core::EventBusError;
use fanout_events::{BroadcastChannel, BroadcastMessage};

use crate::config::KafkaSettings;

const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaBroadcast {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl std::fmt::Debug for KafkaBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroadcast")
            .field("queue_timeout", &self.queue_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaBroadcast {
    /// Create the producer. Brokers are contacted lazily on the first publish.
    pub fn new(settings: &KafkaSettings, client_id: &str) -> Result<Self, EventBusError> {
        let mut config = ClientConfig::new();
        for (key, value) in settings.producer_properties(client_id)? {
            config.set(key, value);
        }

        let producer: FutureProducer = config
            .create()
            .map_err(|e| EventBusError::connection(format!("kafka producer: {e}")))?;

        Ok(Self {
            producer,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        })
    }

    /// How long a publish may wait for room in the producer queue.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

fn record_headers(message: &BroadcastMessage) -> OwnedHeaders {
    let headers = message.headers.headers();
    headers.iter().fold(
        OwnedHeaders::new_with_capacity(headers.len()),
        |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        },
    )
}

#[async_trait]
impl BroadcastChannel for KafkaBroadcast {
    #[instrument(skip(self, message), err)]
    async fn publish(&self, topic: &str, message: &BroadcastMessage) -> Result<(), EventBusError> {
        let payload = serde_json::to_string(&message.data)?;
        let mut record = FutureRecord::to(topic)
            .payload(&payload)
            .key(&message.timestamp)
            .headers(record_headers(message));
        if let Some(millis) = message.headers.timestamp_millis() {
            record = record.timestamp(millis);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
            .map_err(|(e, _)| EventBusError::delivery(format!("kafka send to {topic}: {e}")))?;

        debug!(topic, partition, offset, "published to kafka");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rdkafka::message::Headers;
    use serde_json::json;

    use super::*;
    use crate::config::{KafkaRetry, SaslSettings};
    use fanout_events::EnvelopeBuilder;

    fn settings(sasl: Option<SaslSettings>) -> KafkaSettings {
        KafkaSettings {
            brokers: vec!["localhost:9092".into()],
            ssl: false,
            retry: KafkaRetry::default(),
            sasl,
        }
    }

    #[test]
    fn envelope_becomes_record_headers() {
        let envelope = EnvelopeBuilder::new("svc").build("order.created", &BTreeMap::new());
        let expected = envelope.headers().len();
        let message = BroadcastMessage::new(envelope, json!({"id": 1}));

        let headers = record_headers(&message);

        assert_eq!(headers.count(), expected);
        assert!(headers.iter().any(|h| h.key == "X-Event-Name"
            && h.value == Some("order.created".as_bytes())));
    }

    #[test]
    fn producer_is_created_without_contacting_brokers() {
        let broadcast = KafkaBroadcast::new(&settings(None), "svc").unwrap();
        assert_eq!(broadcast.queue_timeout, DEFAULT_QUEUE_TIMEOUT);
    }

    #[test]
    fn aws_sasl_is_a_configuration_error() {
        let err = KafkaBroadcast::new(
            &settings(Some(SaslSettings::Aws {
                authorization_identity: String::new(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                session_token: String::new(),
            })),
            "svc",
        )
        .unwrap_err();

        assert!(matches!(err, EventBusError::Configuration(_)));
    }
}
