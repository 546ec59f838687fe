//! Redis-backed durable job queue.
//!
//! Layout under `<prefix>:<queue>`:
//!
//! | Key          | Type | Holds |
//! |--------------|------|-------|
//! | `:jobs`      | hash | job id -> record JSON |
//! | `:wait`      | list | ids ready to claim, FIFO |
//! | `:delayed`   | zset | ids scored by run-at (unix ms) |
//! | `:active`    | zset | claimed ids scored by claim time (unix ms) |
//! | `:completed` | set  | kept ids of resolved jobs |
//! | `:failed`    | hash | job id -> failure reason |
//!
//! A bulk enqueue is a single MULTI/EXEC, so the batch becomes visible at once.
//! Claims older than the lease are moved back to `:wait` by `recover_stalled`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use fanout_core::{EventBusError, JobId};
use fanout_events::{DurableQueue, JobRecord};

use super::{RedisBusError, with_connection};
use crate::jobs::{ClaimQueue, JobQueueError, QueueStats};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    jobs: String,
    wait: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(queue_key: &str) -> Self {
        Self {
            jobs: format!("{queue_key}:jobs"),
            wait: format!("{queue_key}:wait"),
            delayed: format!("{queue_key}:delayed"),
            active: format!("{queue_key}:active"),
            completed: format!("{queue_key}:completed"),
            failed: format!("{queue_key}:failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: redis::Client,
    keys: QueueKeys,
}

impl RedisJobQueue {
    /// `queue_key` is the full key prefix, e.g. `EventBusService:events-queue`.
    pub fn new(redis_url: impl AsRef<str>, queue_key: &str) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            keys: QueueKeys::new(queue_key),
        })
    }

    /// Whether the record is still stored (any status).
    pub async fn contains(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let jobs = self.keys.jobs.clone();
        let id = job_id.to_string();
        Ok(with_connection(&self.client, "HEXISTS", move |conn| {
            redis::cmd("HEXISTS").arg(&jobs).arg(&id).query(conn)
        })
        .await?)
    }

    async fn require(&self, job_id: JobId) -> Result<(), JobQueueError> {
        if self.contains(job_id).await? {
            Ok(())
        } else {
            Err(JobQueueError::NotFound(job_id))
        }
    }
}

#[async_trait]
impl DurableQueue for RedisJobQueue {
    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn enqueue_bulk(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, EventBusError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            entries.push((record.id.to_string(), serde_json::to_string(record)?));
        }
        let ids: Vec<JobId> = records.iter().map(|r| r.id).collect();

        let keys = self.keys.clone();
        let existing: Vec<bool> = {
            let keys = keys.clone();
            let candidates: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
            with_connection(&self.client, "HEXISTS", move |conn| {
                let mut pipe = redis::pipe();
                for id in &candidates {
                    pipe.cmd("HEXISTS").arg(&keys.jobs).arg(id);
                }
                pipe.query(conn)
            })
            .await
            .map_err(JobQueueError::from)?
        };
        if let Some(pos) = existing.iter().position(|exists| *exists) {
            return Err(JobQueueError::AlreadyExists(ids[pos]).into());
        }

        with_connection(&self.client, "enqueue_bulk", move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (id, json) in &entries {
                pipe.cmd("HSET").arg(&keys.jobs).arg(id).arg(json).ignore();
                pipe.cmd("RPUSH").arg(&keys.wait).arg(id).ignore();
            }
            pipe.query::<()>(conn)
        })
        .await
        .map_err(JobQueueError::from)?;

        Ok(ids)
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, attempt = record.attempt), err)]
    async fn update(&self, record: &JobRecord) -> Result<(), EventBusError> {
        self.require(record.id).await?;

        let jobs = self.keys.jobs.clone();
        let id = record.id.to_string();
        let json = serde_json::to_string(record)?;

        with_connection(&self.client, "HSET", move |conn| {
            redis::cmd("HSET").arg(&jobs).arg(&id).arg(&json).query::<()>(conn)
        })
        .await
        .map_err(JobQueueError::from)?;
        Ok(())
    }
}

#[async_trait]
impl ClaimQueue for RedisJobQueue {
    async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError> {
        let keys = self.keys.clone();
        let now_ms = Utc::now().timestamp_millis();

        let json: Option<String> = with_connection(&self.client, "claim", move |conn| {
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&keys.delayed)
                .arg("-inf")
                .arg(now_ms)
                .query(conn)?;
            for id in &due {
                // Only the consumer whose ZREM wins moves the id.
                let removed: i64 = redis::cmd("ZREM").arg(&keys.delayed).arg(id).query(conn)?;
                if removed == 1 {
                    redis::cmd("RPUSH").arg(&keys.wait).arg(id).query::<()>(conn)?;
                }
            }

            loop {
                let id: Option<String> = redis::cmd("LPOP").arg(&keys.wait).query(conn)?;
                let Some(id) = id else {
                    return Ok(None);
                };
                let record: Option<String> =
                    redis::cmd("HGET").arg(&keys.jobs).arg(&id).query(conn)?;
                if let Some(record) = record {
                    redis::cmd("ZADD")
                        .arg(&keys.active)
                        .arg(now_ms)
                        .arg(&id)
                        .query::<()>(conn)?;
                    return Ok(Some(record));
                }
            }
        })
        .await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        self.require(record.id).await?;

        let keys = self.keys.clone();
        let id = record.id.to_string();
        let remove = record.remove_on_complete;

        with_connection(&self.client, "complete", move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("ZREM").arg(&keys.active).arg(&id).ignore();
            if remove {
                pipe.cmd("HDEL").arg(&keys.jobs).arg(&id).ignore();
            } else {
                pipe.cmd("SADD").arg(&keys.completed).arg(&id).ignore();
            }
            pipe.query::<()>(conn)
        })
        .await?;
        Ok(())
    }

    async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError> {
        self.require(job_id).await?;

        let keys = self.keys.clone();
        let id = job_id.to_string();
        let run_at = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);

        with_connection(&self.client, "reschedule", move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("ZREM").arg(&keys.active).arg(&id).ignore();
            if delay.is_zero() {
                pipe.cmd("RPUSH").arg(&keys.wait).arg(&id).ignore();
            } else {
                pipe.cmd("ZADD").arg(&keys.delayed).arg(run_at).arg(&id).ignore();
            }
            pipe.query::<()>(conn)
        })
        .await?;

        debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "job rescheduled");
        Ok(())
    }

    async fn fail_permanently(
        &self,
        record: &JobRecord,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        self.require(record.id).await?;

        let keys = self.keys.clone();
        let id = record.id.to_string();
        let reason = reason.to_string();

        with_connection(&self.client, "fail", move |conn| {
            redis::pipe()
                .atomic()
                .cmd("ZREM")
                .arg(&keys.active)
                .arg(&id)
                .ignore()
                .cmd("HSET")
                .arg(&keys.failed)
                .arg(&id)
                .arg(&reason)
                .ignore()
                .query::<()>(conn)
        })
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, JobQueueError> {
        let keys = self.keys.clone();

        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            with_connection(&self.client, "stats", move |conn| {
                redis::pipe()
                    .cmd("LLEN")
                    .arg(&keys.wait)
                    .cmd("ZCARD")
                    .arg(&keys.delayed)
                    .cmd("ZCARD")
                    .arg(&keys.active)
                    .cmd("SCARD")
                    .arg(&keys.completed)
                    .cmd("HLEN")
                    .arg(&keys.failed)
                    .query(conn)
            })
            .await?;

        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError> {
        let keys = self.keys.clone();
        let cutoff = Utc::now().timestamp_millis()
            - i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);

        let released = with_connection(&self.client, "recover_stalled", move |conn| {
            let stalled: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&keys.active)
                .arg("-inf")
                .arg(cutoff)
                .query(conn)?;

            let mut released = 0;
            for id in &stalled {
                // A concurrent settle or recovery may have removed it already.
                let removed: i64 = redis::cmd("ZREM").arg(&keys.active).arg(id).query(conn)?;
                if removed == 1 {
                    redis::cmd("RPUSH").arg(&keys.wait).arg(id).query::<()>(conn)?;
                    released += 1;
                }
            }
            Ok(released)
        })
        .await?;

        if released > 0 {
            debug!(released, "stalled jobs released");
        }
        Ok(released)
    }
}
