use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use fanout_core::EventToken;

pub const HEADER_EVENT_NAME: &str = "X-Event-Name";
pub const HEADER_EVENT_TOKEN: &str = "X-Event-Token";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_EVENT_SOURCE: &str = "X-Event-Source";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Metadata header set attached to every broadcast and durable payload.
///
/// Notes:
/// - Built fresh for every emission by [`EnvelopeBuilder`].
/// - On the wire this is a flat string map (`X-Event-Name`, `X-Event-Token`, ...).
/// - Caller-supplied headers may override any default, so accessors read the
///   merged map rather than the generated values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    headers: BTreeMap<String, String>,
}

impl Envelope {
    pub fn from_headers(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.header(HEADER_EVENT_NAME)
    }

    pub fn token(&self) -> Option<&str> {
        self.header(HEADER_EVENT_TOKEN)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    /// Epoch-millisecond timestamp, as carried on the wire.
    pub fn timestamp(&self) -> Option<&str> {
        self.header(HEADER_TIMESTAMP)
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp().and_then(|t| t.parse().ok())
    }

    pub fn source_tag(&self) -> Option<&str> {
        self.header(HEADER_EVENT_SOURCE)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn into_headers(self) -> BTreeMap<String, String> {
        self.headers
    }
}

/// Produces per-emission envelopes.
///
/// Pure apart from the clock and the token source.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    source_tag: String,
}

impl EnvelopeBuilder {
    /// `source_tag` is the deployment-configured origin (`APP_NAME`).
    pub fn new(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
        }
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Build an envelope for `event_name`; caller headers win on key collision.
    pub fn build(&self, event_name: &str, caller_headers: &BTreeMap<String, String>) -> Envelope {
        let timestamp = Utc::now().timestamp_millis().to_string();

        let mut headers = BTreeMap::from([
            (HEADER_EVENT_NAME.to_string(), event_name.to_string()),
            (HEADER_EVENT_TOKEN.to_string(), EventToken::new().to_string()),
            (HEADER_CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string()),
            (HEADER_TIMESTAMP.to_string(), timestamp),
            (HEADER_EVENT_SOURCE.to_string(), self.source_tag.clone()),
        ]);

        headers.extend(caller_headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        Envelope { headers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_header_set() {
        let builder = EnvelopeBuilder::new("orders-service");
        let envelope = builder.build("order.created", &BTreeMap::new());

        assert_eq!(envelope.event_name(), Some("order.created"));
        assert_eq!(envelope.content_type(), Some(JSON_CONTENT_TYPE));
        assert_eq!(envelope.source_tag(), Some("orders-service"));
        assert!(envelope.token().is_some());
        assert!(envelope.timestamp_millis().is_some_and(|t| t > 0));
    }

    #[test]
    fn caller_headers_override_defaults() {
        let builder = EnvelopeBuilder::new("orders-service");
        let caller = BTreeMap::from([
            (HEADER_EVENT_SOURCE.to_string(), "backfill".to_string()),
            ("X-Tenant".to_string(), "acme".to_string()),
        ]);

        let envelope = builder.build("order.created", &caller);

        assert_eq!(envelope.source_tag(), Some("backfill"));
        assert_eq!(envelope.header("X-Tenant"), Some("acme"));
        assert_eq!(envelope.event_name(), Some("order.created"));
    }

    #[test]
    fn tokens_are_unique_within_the_same_millisecond() {
        let builder = EnvelopeBuilder::default();
        let envelopes: Vec<_> = (0..64)
            .map(|_| builder.build("order.created", &BTreeMap::new()))
            .collect();

        let mut tokens: Vec<_> = envelopes.iter().filter_map(|e| e.token()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        assert_eq!(tokens.len(), envelopes.len());
    }

    #[test]
    fn serializes_as_flat_header_map() {
        let envelope = EnvelopeBuilder::new("svc").build("a.b", &BTreeMap::new());
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["X-Event-Name"], "a.b");
        assert_eq!(json["Content-Type"], "application/json");
    }
}
