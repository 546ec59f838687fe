//! `fanout-core`: shared building blocks for the event bus.
//!
//! This crate contains identifiers and the error taxonomy only (no IO).

pub mod error;
pub mod id;

pub use error::{EventBusError, EventBusResult, SubscriberError};
pub use id::{EventToken, JobId, SubscriberId};
