//! Postgres-backed durable job queue.
//!
//! Schema (created by [`PostgresJobQueue::ensure_schema`]):
//!
//! ```sql
//! CREATE TABLE event_jobs (
//!     id          UUID PRIMARY KEY,
//!     queue       TEXT NOT NULL,
//!     event_name  TEXT NOT NULL,
//!     record      JSONB NOT NULL,
//!     status      TEXT NOT NULL,
//!     run_at      TIMESTAMPTZ NOT NULL,
//!     last_error  TEXT,
//!     claimed_at  TIMESTAMPTZ,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobQueueError |
//! |------------|---------------|
//! | Database `23505` (unique violation) | `AlreadyExists` |
//! | PoolClosed / Io / Tls / PoolTimedOut | `Connection` |
//! | Other | `Storage` |
//!
//! Bulk enqueue runs in a single transaction, so a failed batch leaves no rows
//! behind. Claiming uses `FOR UPDATE SKIP LOCKED`, which lets any number of
//! consumers poll the same queue without handing one record to two of them.
//! `claimed_at` is the claim lease: active rows whose claim is older than the
//! lease are put back by `recover_stalled`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use fanout_core::{EventBusError, JobId};
use fanout_events::{DurableQueue, JobRecord};

use super::store::ClaimQueue;
use super::types::{JobQueueError, QueueStats, QueueStatus};

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    queue: String,
}

impl PostgresJobQueue {
    /// `queue` namespaces rows so several buses can share one table.
    pub fn new(pool: PgPool, queue: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Create the jobs table and its claim index if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobQueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_jobs (
                id          UUID PRIMARY KEY,
                queue       TEXT NOT NULL,
                event_name  TEXT NOT NULL,
                record      JSONB NOT NULL,
                status      TEXT NOT NULL,
                run_at      TIMESTAMPTZ NOT NULL,
                last_error  TEXT,
                claimed_at  TIMESTAMPTZ,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query("ALTER TABLE event_jobs ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_claimed_at", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS event_jobs_claim_idx
                ON event_jobs (queue, status, run_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    #[instrument(skip(self, records), fields(queue = %self.queue, count = records.len()), err)]
    async fn insert_all(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, JobQueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let json = serde_json::to_value(&record)?;

            sqlx::query(
                r#"
                INSERT INTO event_jobs (id, queue, event_name, record, status, run_at)
                VALUES ($1, $2, $3, $4, 'waiting', NOW())
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&self.queue)
            .bind(record.event_name())
            .bind(&json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobQueueError::AlreadyExists(record.id)
                } else {
                    map_sqlx_error("insert_job", e)
                }
            })?;

            ids.push(record.id);
        }

        // Dropping `tx` on an early return rolls the whole batch back.
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(ids)
    }

    async fn set_status(
        &self,
        operation: &str,
        job_id: JobId,
        status: &QueueStatus,
        last_error: Option<&str>,
    ) -> Result<(), JobQueueError> {
        let result = sqlx::query(
            r#"
            UPDATE event_jobs
            SET status = $3,
                last_error = COALESCE($4, last_error),
                claimed_at = NULL,
                updated_at = NOW()
            WHERE queue = $1 AND id = $2
            "#,
        )
        .bind(&self.queue)
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for PostgresJobQueue {
    async fn enqueue_bulk(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, EventBusError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.insert_all(records).await?)
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, attempt = record.attempt), err)]
    async fn update(&self, record: &JobRecord) -> Result<(), EventBusError> {
        let json = serde_json::to_value(record)?;

        let result = sqlx::query(
            r#"
            UPDATE event_jobs
            SET record = $3, updated_at = NOW()
            WHERE queue = $1 AND id = $2
            "#,
        )
        .bind(&self.queue)
        .bind(record.id.as_uuid())
        .bind(&json)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(record.id).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimQueue for PostgresJobQueue {
    #[instrument(skip(self), fields(queue = %self.queue), err)]
    async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError> {
        let row = sqlx::query(
            r#"
            UPDATE event_jobs
            SET status = 'active', claimed_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM event_jobs
                WHERE queue = $1
                  AND status IN ('waiting', 'delayed')
                  AND run_at <= NOW()
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING record
            "#,
        )
        .bind(&self.queue)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        match row {
            Some(row) => {
                let json: serde_json::Value = row
                    .try_get("record")
                    .map_err(|e| map_sqlx_error("decode_record", e))?;
                Ok(Some(serde_json::from_value(json)?))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        if !record.remove_on_complete {
            return self
                .set_status("complete_job", record.id, &QueueStatus::Completed, None)
                .await;
        }

        let result = sqlx::query("DELETE FROM event_jobs WHERE queue = $1 AND id = $2")
            .bind(&self.queue)
            .bind(record.id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(record.id));
        }
        Ok(())
    }

    async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError> {
        let result = sqlx::query(
            r#"
            UPDATE event_jobs
            SET status = 'delayed',
                run_at = NOW() + ($3 * INTERVAL '1 second'),
                claimed_at = NULL,
                updated_at = NOW()
            WHERE queue = $1 AND id = $2
            "#,
        )
        .bind(&self.queue)
        .bind(job_id.as_uuid())
        .bind(delay.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn fail_permanently(
        &self,
        record: &JobRecord,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        let status = QueueStatus::Failed {
            reason: reason.to_string(),
        };
        self.set_status("fail_job", record.id, &status, Some(reason))
            .await
    }

    async fn stats(&self) -> Result<QueueStats, JobQueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM event_jobs
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(&self.queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("decode_stats", e))?;
            let count = usize::try_from(count).unwrap_or_default();

            match status.as_str() {
                "waiting" => stats.waiting += count,
                "delayed" => stats.delayed += count,
                "active" => stats.active += count,
                "completed" => stats.completed += count,
                "failed" => stats.failed += count,
                _ => {}
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(queue = %self.queue), err)]
    async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError> {
        let result = sqlx::query(
            r#"
            UPDATE event_jobs
            SET status = 'waiting', run_at = NOW(), claimed_at = NULL, updated_at = NOW()
            WHERE queue = $1
              AND status = 'active'
              AND claimed_at <= NOW() - ($2 * INTERVAL '1 second')
            "#,
        )
        .bind(&self.queue)
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stalled", e))?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobQueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobQueueError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            JobQueueError::Connection(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => JobQueueError::Connection(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => {
            JobQueueError::Connection(format!("tls error in {}: {}", operation, e))
        }
        other => JobQueueError::Storage(format!("{} failed: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_connection_errors() {
        let err = map_sqlx_error("claim_job", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobQueueError::Connection(_)));

        let bus: EventBusError = err.into();
        assert!(matches!(bus, EventBusError::Connection(_)));
    }

    #[test]
    fn other_errors_are_storage_errors() {
        let err = map_sqlx_error("claim_job", sqlx::Error::RowNotFound);
        assert!(matches!(err, JobQueueError::Storage(msg) if msg.contains("claim_job")));
    }

    #[test]
    fn row_not_found_is_not_a_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
