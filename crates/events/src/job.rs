//! Durable job records: one per emitted event, spanning all delivery attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use fanout_core::{JobId, SubscriberId};

use crate::envelope::Envelope;
use crate::options::EmitOptions;

/// Persisted job payload: `{eventName, data, completedSubscriberIds?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub event_name: String,

    pub data: JsonValue,

    /// Ids of subscribers that already succeeded on an earlier attempt.
    ///
    /// Never shrinks and never holds duplicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_subscriber_ids: Vec<SubscriberId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

/// One event's delivery lifecycle across attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,

    pub data: JobData,

    /// 1-indexed number of the attempt this record is (or will be) processed as.
    ///
    /// Advanced once per processed attempt, at the moment the next attempt is
    /// scheduled. A resolved record is never scheduled again, so a kept record
    /// (`remove_on_complete = false`) reports the attempt that resolved it and
    /// `attempt <= max_attempts` always holds.
    pub attempt: u32,

    pub max_attempts: u32,

    pub remove_on_complete: bool,

    /// Adapter-specific pass-through options.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, JsonValue>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a record for a fresh emission: empty completed-set, `attempt = 1`.
    pub fn new(
        event_name: impl Into<String>,
        data: JsonValue,
        envelope: Option<Envelope>,
        options: &EmitOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            data: JobData {
                event_name: event_name.into(),
                data,
                completed_subscriber_ids: Vec::new(),
                envelope,
            },
            attempt: 1,
            max_attempts: options.effective_attempts(),
            remove_on_complete: options.effective_remove_on_complete(),
            extra: options.extra.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.data.event_name
    }

    pub fn completed_subscriber_ids(&self) -> &[SubscriberId] {
        &self.data.completed_subscriber_ids
    }

    pub fn has_completed(&self, id: &SubscriberId) -> bool {
        self.data.completed_subscriber_ids.contains(id)
    }

    /// Strict equality against the configured maximum.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt == self.max_attempts
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Merge ids into the completed-set, skipping ones already present.
    ///
    /// Returns the number of ids actually added.
    pub fn merge_completed<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = SubscriberId>,
    {
        let mut added = 0;
        for id in ids {
            if !self.has_completed(&id) {
                self.data.completed_subscriber_ids.push(id);
                added += 1;
            }
        }
        if added > 0 {
            self.updated_at = Utc::now();
        }
        added
    }

    /// Advance to the next attempt number.
    pub fn advance_attempt(&mut self) {
        self.attempt += 1;
        self.updated_at = Utc::now();
    }
}
