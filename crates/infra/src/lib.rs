//! Infrastructure layer: queues, transports, config and service wiring.
//!
//! Redis transports are behind the `redis` feature and the Kafka broadcast
//! behind `kafka`; the in-memory and Postgres queues are always available.

pub mod config;
pub mod event_bus;
pub mod jobs;
#[cfg(feature = "redis")]
pub mod kv;
pub mod service;


pub use config::{BusConfig, ConfigError, KafkaSettings, RedisSettings, SaslSettings};
pub use event_bus::RedisBusError;
pub use service::{EventBusService, consumer_config};
