//! Subscriber capability and descriptors.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use fanout_core::{SubscriberError, SubscriberId};

/// Name under which catch-all subscribers are registered.
pub const WILDCARD: &str = "*";

/// Something that consumes events.
///
/// Implementations must tolerate redelivery: the bus is at-least-once, and a
/// subscriber registered without an id is re-run on every retry of a job.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn invoke(
        &self,
        payload: &JsonValue,
        event_name: &str,
    ) -> Result<JsonValue, SubscriberError>;
}

/// Adapter turning an async closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(JsonValue, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, SubscriberError>> + Send + 'static,
{
    async fn invoke(
        &self,
        payload: &JsonValue,
        event_name: &str,
    ) -> Result<JsonValue, SubscriberError> {
        (self.f)(payload.clone(), event_name.to_string()).await
    }
}

/// Wrap an async closure as a shareable subscriber handle.
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(JsonValue, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, SubscriberError>> + Send + 'static,
{
    Arc::new(FnSubscriber { f })
}

/// Where a subscriber is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Exact event name.
    Named(String),
    /// Every event (`"*"`).
    Wildcard,
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::Named(name) => name,
            Topic::Wildcard => WILDCARD,
        }
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        if value == WILDCARD {
            Topic::Wildcard
        } else {
            Topic::Named(value.to_string())
        }
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        if value == WILDCARD {
            Topic::Wildcard
        } else {
            Topic::Named(value)
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered subscriber: optional identity plus the handler.
#[derive(Clone)]
pub struct SubscriberDescriptor {
    id: Option<SubscriberId>,
    handler: Arc<dyn Subscriber>,
}

impl SubscriberDescriptor {
    /// Anonymous subscriber. It forfeits retry deduplication.
    pub fn new(handler: Arc<dyn Subscriber>) -> Self {
        Self { id: None, handler }
    }

    pub fn with_id(id: impl Into<SubscriberId>, handler: Arc<dyn Subscriber>) -> Self {
        Self {
            id: Some(id.into()),
            handler,
        }
    }

    pub fn id(&self) -> Option<&SubscriberId> {
        self.id.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn Subscriber> {
        &self.handler
    }
}

impl core::fmt::Debug for SubscriberDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriberDescriptor")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_topic_parses_from_star() {
        assert_eq!(Topic::from("*"), Topic::Wildcard);
        assert_eq!(Topic::from("order.created"), Topic::Named("order.created".into()));
        assert_eq!(Topic::Wildcard.to_string(), "*");
    }

    #[tokio::test]
    async fn closure_subscriber_receives_payload_and_name() {
        let handler = subscriber_fn(|payload, name| async move {
            Ok(json!({"seen": name, "id": payload["id"]}))
        });

        let out = handler
            .invoke(&json!({"id": 9}), "order.created")
            .await
            .unwrap();

        assert_eq!(out, json!({"seen": "order.created", "id": 9}));
    }
}
