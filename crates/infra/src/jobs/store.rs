//! Claimable job queues and the in-memory implementation.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fanout_core::{EventBusError, JobId};
use fanout_events::{DurableQueue, JobRecord};

use super::types::{JobQueueError, QueueStats, QueueStatus};

/// Consumer-facing side of a durable queue.
///
/// A claimed record is exclusively owned by one consumer until it is completed,
/// rescheduled or failed, or until its claim lease runs out. Records whose
/// consumer vanished are handed out again by [`ClaimQueue::recover_stalled`].
#[async_trait]
pub trait ClaimQueue: Send + Sync {
    /// Claim the next ready record, if any.
    async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError>;

    /// Acknowledge a resolved record (dropped when `remove_on_complete`).
    async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError>;

    /// Make a record claimable again after `delay`.
    async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError>;

    /// Park a record for inspection; it will not be claimed again.
    async fn fail_permanently(&self, record: &JobRecord, reason: &str)
    -> Result<(), JobQueueError>;

    async fn stats(&self) -> Result<QueueStats, JobQueueError>;

    /// Move records claimed more than `lease` ago back to waiting.
    ///
    /// Returns how many records were released.
    async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError>;
}

#[async_trait]
impl<C> ClaimQueue for Arc<C>
where
    C: ClaimQueue + ?Sized,
{
    async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError> {
        (**self).claim().await
    }

    async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        (**self).complete(record).await
    }

    async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError> {
        (**self).reschedule(job_id, delay).await
    }

    async fn fail_permanently(
        &self,
        record: &JobRecord,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        (**self).fail_permanently(record, reason).await
    }

    async fn stats(&self) -> Result<QueueStats, JobQueueError> {
        (**self).stats().await
    }

    async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError> {
        (**self).recover_stalled(lease).await
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    record: JobRecord,
    status: QueueStatus,
    /// Set while `Active`.
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    ready: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(run_at, id)) = self.delayed.first() {
            if run_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = QueueStatus::Waiting;
                self.ready.push_back(id);
            }
        }
    }
}

/// In-memory durable queue for tests/dev and single-process deployments.
///
/// All state sits behind one lock, so a bulk enqueue is observed either
/// completely or not at all.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.lock().jobs.get(&job_id).map(|j| j.record.clone())
    }

    pub fn status(&self, job_id: JobId) -> Option<QueueStatus> {
        self.lock().jobs.get(&job_id).map(|j| j.status.clone())
    }

    /// Number of records currently held (any status).
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DurableQueue for InMemoryJobQueue {
    async fn enqueue_bulk(&self, records: Vec<JobRecord>) -> Result<Vec<JobId>, EventBusError> {
        let mut state = self.lock();

        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if state.jobs.contains_key(&record.id) || !seen.insert(record.id) {
                return Err(JobQueueError::AlreadyExists(record.id).into());
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            state.jobs.insert(
                id,
                StoredJob {
                    record,
                    status: QueueStatus::Waiting,
                    claimed_at: None,
                },
            );
            state.ready.push_back(id);
            ids.push(id);
        }

        Ok(ids)
    }

    async fn update(&self, record: &JobRecord) -> Result<(), EventBusError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&record.id)
            .ok_or(JobQueueError::NotFound(record.id))?;
        job.record = record.clone();
        Ok(())
    }
}

#[async_trait]
impl ClaimQueue for InMemoryJobQueue {
    async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError> {
        let mut state = self.lock();
        state.promote_due(Utc::now());

        while let Some(id) = state.ready.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == QueueStatus::Waiting {
                    job.status = QueueStatus::Active;
                    job.claimed_at = Some(Utc::now());
                    return Ok(Some(job.record.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        let mut state = self.lock();
        if !state.jobs.contains_key(&record.id) {
            return Err(JobQueueError::NotFound(record.id));
        }

        if record.remove_on_complete {
            state.jobs.remove(&record.id);
        } else if let Some(job) = state.jobs.get_mut(&record.id) {
            job.status = QueueStatus::Completed;
            job.claimed_at = None;
        }
        Ok(())
    }

    async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobQueueError::NotFound(job_id))?;
        job.claimed_at = None;

        if delay.is_zero() {
            job.status = QueueStatus::Waiting;
            state.ready.push_back(job_id);
        } else {
            job.status = QueueStatus::Delayed;
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            state.delayed.insert((run_at, job_id));
        }
        Ok(())
    }

    async fn fail_permanently(
        &self,
        record: &JobRecord,
        reason: &str,
    ) -> Result<(), JobQueueError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&record.id)
            .ok_or(JobQueueError::NotFound(record.id))?;
        job.status = QueueStatus::Failed {
            reason: reason.to_string(),
        };
        job.claimed_at = None;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, JobQueueError> {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            stats.record(&job.status);
        }
        Ok(stats)
    }

    async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError> {
        let Some(cutoff) = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        else {
            return Ok(0);
        };

        let mut state = self.lock();

        let mut released = Vec::new();
        for (id, job) in state.jobs.iter_mut() {
            let expired = job.claimed_at.is_some_and(|at| at <= cutoff);
            if job.status == QueueStatus::Active && expired {
                job.status = QueueStatus::Waiting;
                job.claimed_at = None;
                released.push(*id);
            }
        }

        released.sort();
        let count = released.len();
        state.ready.extend(released);
        Ok(count)
    }
}
