//! Emit options and their layering rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Options attached to an emission.
///
/// Every field is optional so that option sets can be layered: built-in defaults,
/// then process-wide job options, then per-call options. A field set in a higher
/// layer always wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitOptions {
    /// Total attempts allowed for the job (>= 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Drop the job record once it resolves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<bool>,

    /// Caller headers merged into the envelope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Adapter-specific pass-through fields.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl EmitOptions {
    /// Built-in defaults: a single attempt, removed on completion.
    pub fn defaults() -> Self {
        Self {
            attempts: Some(1),
            remove_on_complete: Some(true),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Layer `over` on top of `self`; values present in `over` win.
    pub fn layer(&self, over: &EmitOptions) -> EmitOptions {
        let mut merged = self.clone();

        if over.attempts.is_some() {
            merged.attempts = over.attempts;
        }
        if over.remove_on_complete.is_some() {
            merged.remove_on_complete = over.remove_on_complete;
        }
        for (k, v) in &over.headers {
            merged.headers.insert(k.clone(), v.clone());
        }
        for (k, v) in &over.extra {
            merged.extra.insert(k.clone(), v.clone());
        }

        merged
    }

    pub fn effective_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1)
    }

    pub fn effective_remove_on_complete(&self) -> bool {
        self.remove_on_complete.unwrap_or(true)
    }
}
