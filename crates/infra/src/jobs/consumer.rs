//! Queue consumer: claims job records and drives them through the processor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use fanout_events::{AttemptOutcome, DurableQueue, JobProcessor, JobRecord};

use super::store::ClaimQueue;
use super::types::{Backoff, JobQueueError};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How often to poll an empty queue.
    pub poll_interval: Duration,
    /// Maximum attempts processed at once.
    pub concurrency: usize,
    /// Name for logging.
    pub name: String,
    pub backoff: Backoff,
    /// Claims older than this are handed out again.
    pub stalled_after: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            concurrency: 4,
            name: "event-consumer".to_string(),
            backoff: Backoff::default(),
            stalled_after: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stalled_after(mut self, lease: Duration) -> Self {
        self.stalled_after = lease;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub attempts_processed: u64,
    pub resolved: u64,
    pub retried: u64,
    pub failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// How a single claimed attempt was settled with the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Acknowledged; `failed_subscribers` unrecovered failures remain in the outcome.
    Resolved { failed_subscribers: usize },
    Rescheduled { next_attempt: u32, delay: Duration },
    Failed { reason: String },
}

/// Claims records from `C` and runs them through a [`JobProcessor`].
pub struct QueueConsumer<C, Q> {
    queue: Arc<C>,
    processor: Arc<JobProcessor<Q>>,
    config: ConsumerConfig,
}

impl<C, Q> QueueConsumer<C, Q>
where
    C: ClaimQueue + 'static,
    Q: DurableQueue + 'static,
{
    pub fn new(queue: Arc<C>, processor: Arc<JobProcessor<Q>>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Claim and settle one record. `Ok(None)` when the queue is empty.
    ///
    /// A record whose acknowledgement fails is put back on the ready list
    /// before the error is returned.
    pub async fn run_once(&self) -> Result<Option<Settlement>, JobQueueError> {
        match self.queue.claim().await? {
            Some(record) => {
                let settlement =
                    settle_or_release(&*self.queue, &self.processor, &self.config.backoff, record)
                        .await?;
                Ok(Some(settlement))
            }
            None => Ok(None),
        }
    }

    /// Release claims held longer than `stalled_after`.
    pub async fn recover_stalled(&self) -> Result<usize, JobQueueError> {
        release_stalled(&*self.queue, &self.config).await
    }

    /// Process records until the queue has nothing ready. Returns settlements in order.
    pub async fn drain(&self) -> Result<Vec<Settlement>, JobQueueError> {
        self.recover_stalled().await?;
        let mut settled = Vec::new();
        while let Some(s) = self.run_once().await? {
            settled.push(s);
        }
        Ok(settled)
    }

    /// Run the consumer loop on the tokio runtime.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let join = tokio::spawn(consumer_loop(self, shutdown_rx, Arc::clone(&stats)));

        ConsumerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Stop claiming, wait for in-flight attempts to settle and return the final stats.
    pub async fn shutdown(self) -> ConsumerStats {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "consumer loop terminated abnormally");
        }
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn consumer_loop<C, Q>(
    consumer: QueueConsumer<C, Q>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ConsumerStats>>,
) where
    C: ClaimQueue + 'static,
    Q: DurableQueue + 'static,
{
    let QueueConsumer {
        queue,
        processor,
        config,
    } = consumer;

    let start = Instant::now();
    let mut last_recovery: Option<Instant> = None;
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    info!(
        consumer = %config.name,
        concurrency = config.concurrency,
        "queue consumer started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        while in_flight.try_join_next().is_some() {}

        if last_recovery.is_none_or(|at| at.elapsed() >= config.stalled_after) {
            if let Err(e) = release_stalled(&*queue, &config).await {
                error!(consumer = %config.name, error = %e, "failed to recover stalled jobs");
            }
            last_recovery = Some(Instant::now());
        }

        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let record = match queue.claim().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
            Err(e) => {
                error!(consumer = %config.name, error = %e, "failed to claim job");
                drop(permit);
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        update_stats(&stats, start, |s| s.current_running += 1);

        let queue = Arc::clone(&queue);
        let processor = Arc::clone(&processor);
        let backoff = config.backoff.clone();
        let stats = Arc::clone(&stats);
        in_flight.spawn(async move {
            let _permit = permit;
            let job_id = record.id;
            let result = settle_or_release(&*queue, &processor, &backoff, record).await;

            update_stats(&stats, start, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                s.attempts_processed += 1;
                match &result {
                    Ok(Settlement::Resolved { .. }) => s.resolved += 1,
                    Ok(Settlement::Rescheduled { .. }) => s.retried += 1,
                    Ok(Settlement::Failed { .. }) | Err(_) => s.failed += 1,
                }
            });

            if let Err(e) = result {
                error!(job_id = %job_id, error = %e, "failed to settle job");
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    info!(consumer = %config.name, "queue consumer stopped");
}

fn update_stats(
    stats: &Mutex<ConsumerStats>,
    start: Instant,
    f: impl FnOnce(&mut ConsumerStats),
) {
    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut s);
    s.uptime_secs = start.elapsed().as_secs();
}

async fn release_stalled<C>(queue: &C, config: &ConsumerConfig) -> Result<usize, JobQueueError>
where
    C: ClaimQueue + ?Sized,
{
    let released = queue.recover_stalled(config.stalled_after).await?;
    if released > 0 {
        warn!(consumer = %config.name, released, "stalled jobs returned to the queue");
    }
    Ok(released)
}

/// [`settle`], re-queueing the record when its acknowledgement fails.
///
/// If the re-queue fails too the claim stays active until its lease expires.
async fn settle_or_release<C, Q>(
    queue: &C,
    processor: &JobProcessor<Q>,
    backoff: &Backoff,
    record: JobRecord,
) -> Result<Settlement, JobQueueError>
where
    C: ClaimQueue + ?Sized,
    Q: DurableQueue,
{
    let job_id = record.id;
    match settle(queue, processor, backoff, record).await {
        Ok(settlement) => Ok(settlement),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "job could not be settled, re-queueing");
            if let Err(requeue) = queue.reschedule(job_id, Duration::ZERO).await {
                error!(
                    job_id = %job_id,
                    error = %requeue,
                    "job could not be re-queued, waiting for claim lease to expire"
                );
            }
            Err(e)
        }
    }
}

/// Run one attempt and acknowledge it according to the outcome.
pub async fn settle<C, Q>(
    queue: &C,
    processor: &JobProcessor<Q>,
    backoff: &Backoff,
    record: JobRecord,
) -> Result<Settlement, JobQueueError>
where
    C: ClaimQueue + ?Sized,
    Q: DurableQueue,
{
    let claimed = record.clone();

    match processor.process(record).await {
        Ok(AttemptOutcome::Resolved(outcomes)) => {
            queue.complete(&claimed).await?;
            let failed_subscribers = outcomes.iter().filter(|o| !o.is_success()).count();
            debug!(job_id = %claimed.id, failed_subscribers, "job resolved");
            Ok(Settlement::Resolved { failed_subscribers })
        }
        Ok(AttemptOutcome::RetryRequested(updated)) => {
            let delay = backoff.delay_for(updated.attempt.saturating_sub(1));
            queue.reschedule(updated.id, delay).await?;
            debug!(
                job_id = %updated.id,
                next_attempt = updated.attempt,
                delay_ms = delay.as_millis() as u64,
                "job rescheduled"
            );
            Ok(Settlement::Rescheduled {
                next_attempt: updated.attempt,
                delay,
            })
        }
        Ok(AttemptOutcome::ConfigurationFailure(reason)) => {
            warn!(job_id = %claimed.id, reason = %reason, "job failed permanently");
            queue.fail_permanently(&claimed, &reason).await?;
            Ok(Settlement::Failed { reason })
        }
        Err(e) => {
            let reason = e.to_string();
            error!(job_id = %claimed.id, error = %reason, "job attempt could not be recorded");
            queue.fail_permanently(&claimed, &reason).await?;
            Ok(Settlement::Failed { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fanout_core::JobId;
    use serde_json::json;

    use super::*;
    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::{QueueStats, QueueStatus};
    use fanout_core::SubscriberError;
    use fanout_events::{EmitOptions, SubscriberDescriptor, SubscriberRegistry, subscriber_fn};

    fn consumer(
        registry: Arc<SubscriberRegistry>,
        queue: Arc<InMemoryJobQueue>,
    ) -> QueueConsumer<InMemoryJobQueue, Arc<InMemoryJobQueue>> {
        let processor = Arc::new(JobProcessor::new(registry, Arc::clone(&queue)));
        QueueConsumer::new(
            queue,
            processor,
            ConsumerConfig::default().with_backoff(Backoff::none()),
        )
    }

    fn job(attempts: u32) -> JobRecord {
        JobRecord::new(
            "order.created",
            json!({"id": 1}),
            None,
            &EmitOptions::defaults().with_attempts(attempts),
        )
    }

    #[tokio::test]
    async fn flaky_subscriber_is_retried_until_it_succeeds() {
        let registry = Arc::new(SubscriberRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register(
            "order.created",
            SubscriberDescriptor::with_id(
                "flaky",
                subscriber_fn(move |_, _| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(SubscriberError::new("first call fails"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                }),
            ),
        );

        let queue = InMemoryJobQueue::arc();
        queue.enqueue_bulk(vec![job(3)]).await.unwrap();

        let settled = consumer(registry, Arc::clone(&queue)).drain().await.unwrap();

        assert_eq!(
            settled,
            vec![
                Settlement::Rescheduled {
                    next_attempt: 2,
                    delay: Duration::ZERO
                },
                Settlement::Resolved {
                    failed_subscribers: 0
                },
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    fn flaky_registry(calls: &Arc<AtomicUsize>) -> Arc<SubscriberRegistry> {
        let registry = Arc::new(SubscriberRegistry::new());
        let counter = Arc::clone(calls);
        registry.register(
            "order.created",
            SubscriberDescriptor::with_id(
                "flaky",
                subscriber_fn(move |_, _| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(SubscriberError::new("first call fails"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                }),
            ),
        );
        registry
    }

    /// In-memory queue whose first `reschedule` fails.
    struct FirstRescheduleFails {
        inner: Arc<InMemoryJobQueue>,
        reschedules: AtomicUsize,
    }

    #[async_trait]
    impl ClaimQueue for FirstRescheduleFails {
        async fn claim(&self) -> Result<Option<JobRecord>, JobQueueError> {
            self.inner.claim().await
        }

        async fn complete(&self, record: &JobRecord) -> Result<(), JobQueueError> {
            self.inner.complete(record).await
        }

        async fn reschedule(&self, job_id: JobId, delay: Duration) -> Result<(), JobQueueError> {
            if self.reschedules.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(JobQueueError::Connection("transient".into()));
            }
            self.inner.reschedule(job_id, delay).await
        }

        async fn fail_permanently(
            &self,
            record: &JobRecord,
            reason: &str,
        ) -> Result<(), JobQueueError> {
            self.inner.fail_permanently(record, reason).await
        }

        async fn stats(&self) -> Result<QueueStats, JobQueueError> {
            self.inner.stats().await
        }

        async fn recover_stalled(&self, lease: Duration) -> Result<usize, JobQueueError> {
            self.inner.recover_stalled(lease).await
        }
    }

    #[tokio::test]
    async fn failed_reschedule_requeues_the_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = flaky_registry(&calls);

        let inner = InMemoryJobQueue::arc();
        let record = job(3);
        inner.enqueue_bulk(vec![record.clone()]).await.unwrap();

        let queue = Arc::new(FirstRescheduleFails {
            inner: Arc::clone(&inner),
            reschedules: AtomicUsize::new(0),
        });
        let processor = Arc::new(JobProcessor::new(registry, Arc::clone(&inner)));
        let consumer = QueueConsumer::new(
            queue,
            processor,
            ConsumerConfig::default().with_backoff(Backoff::none()),
        );

        assert!(consumer.run_once().await.is_err());
        assert_eq!(inner.status(record.id), Some(QueueStatus::Waiting));

        let settled = consumer.drain().await.unwrap();

        assert_eq!(
            settled,
            vec![Settlement::Resolved {
                failed_subscribers: 0
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(inner.status(record.id), None);
    }

    #[tokio::test]
    async fn abandoned_claim_is_redelivered_after_the_lease() {
        let registry = Arc::new(SubscriberRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register(
            "*",
            SubscriberDescriptor::with_id(
                "sink",
                subscriber_fn(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(null)) }
                }),
            ),
        );

        let queue = InMemoryJobQueue::arc();
        let record = job(1);
        queue.enqueue_bulk(vec![record.clone()]).await.unwrap();

        // Claimed by a consumer that never settles it.
        assert!(queue.claim().await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let processor = Arc::new(JobProcessor::new(registry, Arc::clone(&queue)));
        let consumer = QueueConsumer::new(
            Arc::clone(&queue),
            processor,
            ConsumerConfig::default().with_stalled_after(Duration::from_millis(10)),
        );
        let settled = consumer.drain().await.unwrap();

        assert_eq!(
            settled,
            vec![Settlement::Resolved {
                failed_subscribers: 0
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn kept_record_reports_the_attempt_that_resolved_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = flaky_registry(&calls);

        let queue = InMemoryJobQueue::arc();
        let record = JobRecord::new(
            "order.created",
            json!({"id": 1}),
            None,
            &EmitOptions::defaults()
                .with_attempts(3)
                .with_remove_on_complete(false),
        );
        queue.enqueue_bulk(vec![record.clone()]).await.unwrap();

        consumer(registry, Arc::clone(&queue)).drain().await.unwrap();

        let stored = queue.get(record.id).unwrap();
        assert_eq!(queue.status(record.id), Some(QueueStatus::Completed));
        assert_eq!(stored.attempt, 2);
        assert!(stored.attempt <= stored.max_attempts);
    }

    #[tokio::test]
    async fn attempts_are_bounded_by_max_attempts() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.register(
            "*",
            SubscriberDescriptor::with_id(
                "broken",
                subscriber_fn(|_, _| async { Err(SubscriberError::new("always")) }),
            ),
        );

        let queue = InMemoryJobQueue::arc();
        queue.enqueue_bulk(vec![job(3)]).await.unwrap();

        let settled = consumer(registry, Arc::clone(&queue)).drain().await.unwrap();

        assert_eq!(settled.len(), 3);
        assert_eq!(
            settled.last(),
            Some(&Settlement::Resolved {
                failed_subscribers: 1
            })
        );
    }

    #[tokio::test]
    async fn inconsistent_record_is_failed_permanently() {
        let queue = InMemoryJobQueue::arc();
        let mut bad = job(2);
        bad.attempt = 5;
        queue.enqueue_bulk(vec![bad.clone()]).await.unwrap();

        let settled = consumer(Arc::new(SubscriberRegistry::new()), Arc::clone(&queue))
            .run_once()
            .await
            .unwrap();

        assert!(matches!(settled, Some(Settlement::Failed { .. })));
        assert!(matches!(queue.status(bad.id), Some(QueueStatus::Failed { .. })));
    }

    #[tokio::test]
    async fn spawned_consumer_processes_and_shuts_down() {
        let registry = Arc::new(SubscriberRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register(
            "*",
            SubscriberDescriptor::new(subscriber_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })),
        );

        let queue = InMemoryJobQueue::arc();
        queue
            .enqueue_bulk((0..10).map(|_| job(1)).collect())
            .await
            .unwrap();

        let handle = consumer(registry, Arc::clone(&queue)).spawn();

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.shutdown().await;

        assert!(queue.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(stats.attempts_processed, 10);
        assert_eq!(stats.resolved, 10);
        assert_eq!(stats.current_running, 0);
    }
}
