use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::options::EmitOptions;

/// An application event as handed to `emit`.
///
/// Events are ephemeral: the caller constructs them, the dispatcher turns them
/// into a durable job record plus a broadcast publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Dot-separated event name, e.g. `"order.created"`.
    pub event_name: String,

    /// Opaque JSON payload delivered to subscribers.
    pub data: JsonValue,

    #[serde(default)]
    pub options: EmitOptions,
}

impl Event {
    pub fn new(event_name: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            options: EmitOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EmitOptions) -> Self {
        self.options = options;
        self
    }
}
