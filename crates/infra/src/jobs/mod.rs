//! Durable job queues and the consumer that drives them.
//!
//! ## Components
//!
//! - `ClaimQueue`: consumer-facing side of a durable queue (claim, acknowledge, reschedule,
//!   release stalled claims)
//! - `InMemoryJobQueue`: single-process queue for tests/dev
//! - `PostgresJobQueue`: `event_jobs` table, `FOR UPDATE SKIP LOCKED` claiming
//! - `QueueConsumer`: bounded-concurrency worker loop mapping attempt outcomes to
//!   acknowledgements, with `Backoff` deciding reschedule delays
//!
//! The Redis-backed queue lives in `event_bus::redis_queue` behind the `redis` feature.

pub mod consumer;
pub mod postgres;
pub mod store;
pub mod types;

pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, QueueConsumer, Settlement, settle};
pub use postgres::PostgresJobQueue;
pub use store::{ClaimQueue, InMemoryJobQueue};
pub use types::{Backoff, BackoffStrategy, JobQueueError, QueueStats, QueueStatus};
