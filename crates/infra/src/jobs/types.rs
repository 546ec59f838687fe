//! Queue-side job types: lifecycle status, backoff timing, errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fanout_core::{EventBusError, JobId};

/// Where a job record sits in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its backoff delay to elapse.
    Delayed,
    /// Claimed by a consumer; an attempt is in progress.
    Active,
    /// Resolved and kept (`remove_on_complete = false`).
    Completed,
    /// Given up on: inconsistent counters or unpersistable progress.
    Failed { reason: String },
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Delayed => "delayed",
            QueueStatus::Active => "active",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed { .. })
    }
}

/// Counts per lifecycle status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: &QueueStatus) {
        match status {
            QueueStatus::Waiting => self.waiting += 1,
            QueueStatus::Delayed => self.delayed += 1,
            QueueStatus::Active => self.active += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed { .. } => self.failed += 1,
        }
    }

    /// Jobs not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(n-1)
    #[default]
    Exponential,
    /// base * n
    Linear,
}

/// Delay before a rescheduled attempt.
///
/// The processor decides *whether* to retry; this only decides *when*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(1000), Duration::from_secs(60))
    }
}

impl Backoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay after the `failed_attempts`-th failed attempt (1-indexed).
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(failed_attempts - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(failed_attempts),
        };

        delay.min(self.max_delay.max(self.base_delay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for JobQueueError {
    fn from(value: serde_json::Error) -> Self {
        JobQueueError::Serialization(value.to_string())
    }
}

impl From<JobQueueError> for EventBusError {
    fn from(value: JobQueueError) -> Self {
        match value {
            JobQueueError::NotFound(id) => EventBusError::not_found(format!("job {id}")),
            JobQueueError::Connection(msg) => EventBusError::connection(msg),
            JobQueueError::Serialization(msg) => EventBusError::serialization(msg),
            other => EventBusError::enqueue(other.to_string()),
        }
    }
}
