//! Dual-channel event delivery.
//!
//! Events are emitted once and travel two independent paths:
//! - a durable, retryable job queue whose records are processed by
//!   [`processor::JobProcessor`] against the [`registry::SubscriberRegistry`]
//! - a best-effort broadcast channel for external observers
//!
//! This crate holds the delivery logic and the adapter traits. Concrete
//! transports (Redis, Postgres, in-memory job queues) live in the infra crate.

pub mod bus;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod job;
pub mod options;
pub mod processor;
pub mod registry;
pub mod subscriber;

pub use bus::{BroadcastChannel, BroadcastMessage, DurableQueue};
pub use dispatcher::{BroadcastFailure, EmitReceipt, EventDispatcher};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use event::Event;
pub use in_memory_bus::{BroadcastSubscription, InMemoryBroadcast, Published};
pub use job::{JobData, JobRecord};
pub use options::EmitOptions;
pub use processor::{AttemptOutcome, JobProcessor, SubscriberOutcome};
pub use registry::SubscriberRegistry;
pub use subscriber::{Subscriber, SubscriberDescriptor, Topic, WILDCARD, subscriber_fn};
