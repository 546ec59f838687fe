//! Error model shared by the dispatch path, the worker and the adapters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the event bus.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Event-bus level error.
///
/// Subscriber failures are deliberately not part of this enum: they are captured
/// per subscriber as [`SubscriberError`] and never abort a processing attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Required settings are absent or malformed (fatal at startup).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker or store could not be reached. No automatic reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// The durable bulk enqueue (or a record update) failed.
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    /// A broadcast publish failed. Logged and swallowed on the emit path.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A job record referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl EventBusError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn enqueue(msg: impl Into<String>) -> Self {
        Self::Enqueue(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Failure of a single subscriber invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct SubscriberError {
    message: String,
}

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for SubscriberError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SubscriberError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
