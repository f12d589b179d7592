// Worker pool: bounded concurrency, shared rate limit, retry with backoff

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::events::{JobEvent, JobEvents};
use crate::queue::jobs::{Job, JobKind};
use crate::queue::metrics::PoolMetrics;
use crate::queue::rate_limiter::SlidingWindowLimiter;
use crate::queue::store::{JobStore, StallReport, StoreError, StoreResult, STALLED_ERROR};
use crate::utils::{backoff_delay, chrono_duration, Clock, SystemClock};

/// What the pool should do with a job whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; retry with backoff while attempts remain.
    Retry,
    /// Permanent; move to failed now.
    Fail,
    /// The subject is gone; drop the job without a failure record.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub disposition: Disposition,
    pub message: String,
    /// Minimum wait before the retry, when the handler knows better than the
    /// exponential backoff.
    pub retry_after: Option<Duration>,
}

impl JobFailure {
    pub fn retry(message: impl Into<String>) -> Self {
        Self { disposition: Disposition::Retry, message: message.into(), retry_after: None }
    }

    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        Self { retry_after: Some(delay), ..Self::retry(message) }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { disposition: Disposition::Fail, message: message.into(), retry_after: None }
    }

    pub fn discard(message: impl Into<String>) -> Self {
        Self { disposition: Disposition::Discard, message: message.into(), retry_after: None }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure>;

    /// Called once a job has used its last attempt on a retryable failure.
    async fn on_exhausted(&self, _job: &Job, _failure: &JobFailure) {}
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            rate_limit_max: 10,
            rate_limit_window: Duration::from_secs(60),
            backoff_base: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(500),
            stall_threshold: Duration::from_secs(120),
            stall_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay: Duration },
    Failed,
    Discarded,
    /// The lock token no longer owned the job when the result came back,
    /// typically because stall recovery reclaimed it.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: String,
    pub kind: JobKind,
    pub attempts: u32,
    pub outcome: JobOutcome,
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    limiter: Arc<SlidingWindowLimiter>,
    events: JobEvents,
    metrics: Arc<PoolMetrics>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
    worker_id: String,
}

/// Running pool tasks. Dropping the handle leaves the tasks running; call
/// `shutdown` to stop them after their in-flight jobs settle.
pub struct PoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

fn worker_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}:{}", host, std::process::id())
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, config: WorkerPoolConfig) -> Self {
        let limiter = SlidingWindowLimiter::new(config.rate_limit_max, config.rate_limit_window);
        Self {
            store,
            handler,
            limiter: Arc::new(limiter),
            events: JobEvents::default(),
            metrics: Arc::new(PoolMetrics::new(config.concurrency)),
            clock: Arc::new(SystemClock),
            config,
            worker_id: worker_identity(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn one task per slot plus the stall checker.
    pub fn start(&self) -> PoolHandle {
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);

        for slot in 0..self.config.concurrency.max(1) {
            let pool = self.clone();
            let shutdown = rx.clone();
            tasks.push(tokio::spawn(async move { pool.run_slot(slot, shutdown).await }));
        }

        let pool = self.clone();
        tasks.push(tokio::spawn(async move { pool.run_stall_checker(rx).await }));

        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            rate_limit_max = self.config.rate_limit_max,
            rate_limit_window_secs = self.config.rate_limit_window.as_secs(),
            "Worker pool started"
        );

        PoolHandle { shutdown: tx, tasks }
    }

    async fn run_slot(self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(slot, "Worker slot started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = self.limiter.acquire() => permit,
            };

            let idle = match self.claim_and_run(slot, permit).await {
                Ok(Some(_)) => None,
                Ok(None) => Some(self.config.poll_interval),
                Err(e) => {
                    error!(slot, error = %e, "Worker slot could not reach job store");
                    Some(self.config.poll_interval.max(Duration::from_secs(1)))
                }
            };

            if let Some(wait) = idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(wait) => {}
                }
            }
        }
        debug!(slot, "Worker slot stopped");
    }

    async fn run_stall_checker(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.stall_check_interval,
            self.config.stall_check_interval,
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_stalled().await {
                        error!(error = %e, "Stall check failed");
                    }
                }
            }
        }
    }

    /// Wait for a rate-limit slot, then claim and process at most one job.
    pub async fn run_once(&self, slot: usize) -> StoreResult<Option<JobReport>> {
        let permit = self.limiter.acquire().await;
        self.claim_and_run(slot, permit).await
    }

    async fn claim_and_run(&self, slot: usize, permit: Instant) -> StoreResult<Option<JobReport>> {
        let token = format!("{}:{}:{}", self.worker_id, slot, Uuid::new_v4());
        let job = match self.store.claim(self.clock.now(), &token).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.limiter.refund(permit).await;
                return Ok(None);
            }
            Err(e) => {
                self.limiter.refund(permit).await;
                return Err(e);
            }
        };

        debug!(
            slot,
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Job claimed"
        );

        self.metrics.slot_busy();
        let result = self.handler.handle(&job).await;
        let settled = self.settle(&job, &token, result).await;
        self.metrics.slot_idle();

        let outcome = settled?;
        Ok(Some(JobReport {
            job_id: job.id.clone(),
            kind: job.kind,
            attempts: job.attempts,
            outcome,
        }))
    }

    async fn settle(&self, job: &Job, token: &str, result: Result<(), JobFailure>) -> StoreResult<JobOutcome> {
        let failure = match result {
            Ok(()) => {
                if !self.store.complete(&job.id, token, self.clock.now()).await? {
                    return Ok(self.lost(job));
                }
                self.metrics.record_completed(job.kind);
                self.events.emit(JobEvent::Completed {
                    job_id: job.id.clone(),
                    kind: job.kind,
                    subject_id: job.subject_id.clone(),
                    attempts: job.attempts,
                });
                return Ok(JobOutcome::Completed);
            }
            Err(failure) => failure,
        };

        match failure.disposition {
            Disposition::Retry if job.has_attempts_left() => {
                let backoff = backoff_delay(self.config.backoff_base, job.attempts);
                let delay = failure.retry_after.map_or(backoff, |after| after.max(backoff));
                let delay_until = self.clock.now() + chrono_duration(delay);
                if !self.store.retry(&job.id, token, delay_until, &failure.message).await? {
                    return Ok(self.lost(job));
                }
                self.metrics.record_retried(job.kind);
                self.events.emit(JobEvent::Retrying {
                    job_id: job.id.clone(),
                    kind: job.kind,
                    subject_id: job.subject_id.clone(),
                    attempts: job.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: failure.message.clone(),
                });
                Ok(JobOutcome::Retrying { delay })
            }
            Disposition::Retry | Disposition::Fail => {
                if !self.store.fail(&job.id, token, &failure.message, self.clock.now()).await? {
                    return Ok(self.lost(job));
                }
                self.metrics.record_failed(job.kind);
                self.events.emit(JobEvent::Failed {
                    job_id: job.id.clone(),
                    kind: job.kind,
                    subject_id: job.subject_id.clone(),
                    attempts: job.attempts,
                    error: failure.message.clone(),
                });
                if failure.disposition == Disposition::Retry {
                    self.handler.on_exhausted(job, &failure).await;
                }
                Ok(JobOutcome::Failed)
            }
            Disposition::Discard => {
                if !self.store.discard(&job.id, token).await? {
                    return Ok(self.lost(job));
                }
                self.metrics.record_discarded(job.kind);
                self.events.emit(JobEvent::Discarded {
                    job_id: job.id.clone(),
                    kind: job.kind,
                    subject_id: job.subject_id.clone(),
                    reason: failure.message.clone(),
                });
                Ok(JobOutcome::Discarded)
            }
        }
    }

    fn lost(&self, job: &Job) -> JobOutcome {
        warn!(job_id = %job.id, "Job lock lost before result was recorded");
        JobOutcome::Lost
    }

    /// Return jobs whose worker went quiet to the queue, or fail them once
    /// they are out of attempts.
    pub async fn check_stalled(&self) -> Result<StallReport, StoreError> {
        let now = self.clock.now();
        let active_before = now - chrono_duration(self.config.stall_threshold);
        let report = self.store.reclaim_stalled(active_before, now).await?;

        for job_id in &report.requeued {
            self.events.emit(JobEvent::Stalled { job_id: job_id.clone(), requeued: true });
        }
        for job in &report.failed {
            self.metrics.record_failed(job.kind);
            self.events.emit(JobEvent::Stalled { job_id: job.id.clone(), requeued: false });
            self.handler.on_exhausted(job, &JobFailure::retry(STALLED_ERROR)).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::jobs::{JobOptions, JobState};
    use crate::queue::memory::MemoryJobStore;
    use crate::queue::producer::JobProducer;
    use crate::utils::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedHandler {
        failure: Option<JobFailure>,
        work: Duration,
        calls: AtomicUsize,
        exhausted: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl ScriptedHandler {
        fn succeeding(work: Duration) -> Self {
            Self {
                failure: None,
                work,
                calls: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
            }
        }

        fn failing(failure: JobFailure) -> Self {
            Self { failure: Some(failure), ..Self::succeeding(Duration::ZERO) }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &Job) -> Result<(), JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().unwrap().push(Instant::now());
            if !self.work.is_zero() {
                sleep(self.work).await;
            }
            match &self.failure {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }

        async fn on_exhausted(&self, _job: &Job, _failure: &JobFailure) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unlimited() -> WorkerPoolConfig {
        WorkerPoolConfig { rate_limit_max: 0, ..WorkerPoolConfig::default() }
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_fails() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let handler = Arc::new(ScriptedHandler::failing(JobFailure::retry("provider returned 503")));
        let producer = JobProducer::new(store.clone(), 3).with_clock(clock.clone());
        let pool = WorkerPool::new(store.clone(), handler.clone(), unlimited()).with_clock(clock.clone());

        producer.enqueue(JobKind::TradeAnalysis, "t1", JobOptions::default()).await.unwrap();

        let first = pool.run_once(0).await.unwrap().unwrap();
        assert_eq!(first.outcome, JobOutcome::Retrying { delay: Duration::from_secs(2) });

        // Not eligible until the backoff elapses.
        assert!(pool.run_once(0).await.unwrap().is_none());
        clock.advance(Duration::from_millis(1999));
        assert!(pool.run_once(0).await.unwrap().is_none());
        clock.advance(Duration::from_millis(1));

        let second = pool.run_once(0).await.unwrap().unwrap();
        assert_eq!(second.outcome, JobOutcome::Retrying { delay: Duration::from_secs(4) });

        clock.advance(Duration::from_secs(4));
        let third = pool.run_once(0).await.unwrap().unwrap();
        assert_eq!(third.outcome, JobOutcome::Failed);
        assert_eq!(third.attempts, 3);

        let job = store.get("trade_analysis:t1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("provider returned 503"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);

        let stats = pool.metrics().snapshot();
        assert_eq!(stats.kinds[0].retried, 2);
        assert_eq!(stats.kinds[0].failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(ScriptedHandler::failing(JobFailure::fail("provider rejected request")));
        let producer = JobProducer::new(store.clone(), 3);
        let pool = WorkerPool::new(store.clone(), handler.clone(), unlimited());

        producer.enqueue(JobKind::TradeAnalysis, "t1", JobOptions::default()).await.unwrap();
        let report = pool.run_once(0).await.unwrap().unwrap();

        assert_eq!(report.outcome, JobOutcome::Failed);
        assert_eq!(report.attempts, 1);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discarded_job_leaves_no_record() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(ScriptedHandler::failing(JobFailure::discard("trade not found")));
        let producer = JobProducer::new(store.clone(), 3);
        let pool = WorkerPool::new(store.clone(), handler, unlimited());
        let mut events = pool.events().subscribe();

        producer.enqueue(JobKind::TradeAnalysis, "gone", JobOptions::default()).await.unwrap();
        let report = pool.run_once(0).await.unwrap().unwrap();

        assert_eq!(report.outcome, JobOutcome::Discarded);
        assert!(store.get("trade_analysis:gone").await.unwrap().is_none());
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Discarded { .. }));
    }

    #[tokio::test]
    async fn test_empty_queue_refunds_rate_limit_slot() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(ScriptedHandler::succeeding(Duration::ZERO));
        let config = WorkerPoolConfig { rate_limit_max: 1, ..WorkerPoolConfig::default() };
        let pool = WorkerPool::new(store.clone(), handler, config);

        assert!(pool.run_once(0).await.unwrap().is_none());
        assert_eq!(pool.limiter.in_window().await, 0);
    }

    #[tokio::test]
    async fn test_stall_check_requeues_silent_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let handler = Arc::new(ScriptedHandler::succeeding(Duration::ZERO));
        let producer = JobProducer::new(store.clone(), 3).with_clock(clock.clone());
        let pool = WorkerPool::new(store.clone(), handler, unlimited()).with_clock(clock.clone());

        producer.enqueue(JobKind::TradeAnalysis, "t1", JobOptions::default()).await.unwrap();
        store.claim(clock.now(), "dead-worker").await.unwrap().unwrap();

        assert!(pool.check_stalled().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(121));
        let report = pool.check_stalled().await.unwrap();
        assert_eq!(report.requeued, vec!["trade_analysis:t1".to_string()]);

        let rerun = pool.run_once(0).await.unwrap().unwrap();
        assert_eq!(rerun.outcome, JobOutcome::Completed);
        assert_eq!(rerun.attempts, 2);
    }

    #[tokio::test]
    async fn test_stalled_job_out_of_attempts_runs_exhaustion_hook() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let handler = Arc::new(ScriptedHandler::succeeding(Duration::ZERO));
        let producer = JobProducer::new(store.clone(), 1).with_clock(clock.clone());
        let pool = WorkerPool::new(store.clone(), handler.clone(), unlimited()).with_clock(clock.clone());
        let mut events = pool.events().subscribe();

        producer.enqueue(JobKind::WeeklyInsight, "u1", JobOptions::default()).await.unwrap();
        store.claim(clock.now(), "dead-worker").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(121));
        let report = pool.check_stalled().await.unwrap();

        assert!(report.requeued.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].subject_id, "u1");
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pool.metrics().snapshot().kinds[JobKind::WeeklyInsight.index()].failed, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            JobEvent::Stalled { job_id: "weekly_insight:u1".to_string(), requeued: false }
        );
    }

    #[tokio::test]
    async fn test_retry_after_extends_backoff() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let handler = Arc::new(ScriptedHandler::failing(JobFailure::retry_after(
            "analysis in flight",
            Duration::from_secs(90),
        )));
        let producer = JobProducer::new(store.clone(), 3).with_clock(clock.clone());
        let pool = WorkerPool::new(store.clone(), handler, unlimited()).with_clock(clock.clone());

        producer.enqueue(JobKind::TradeAnalysis, "t1", JobOptions::default()).await.unwrap();
        let report = pool.run_once(0).await.unwrap().unwrap();

        assert_eq!(report.outcome, JobOutcome::Retrying { delay: Duration::from_secs(90) });
        clock.advance(Duration::from_secs(89));
        assert!(pool.run_once(0).await.unwrap().is_none());
        clock.advance(Duration::from_secs(1));
        assert!(pool.run_once(0).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_caps_starts_per_window() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        let handler = Arc::new(ScriptedHandler::succeeding(Duration::from_millis(100)));
        let producer = JobProducer::new(store.clone(), 3).with_clock(clock.clone());
        let pool = WorkerPool::new(store.clone(), handler.clone(), WorkerPoolConfig::default())
            .with_clock(clock.clone());

        for i in 0..20 {
            producer
                .enqueue(JobKind::TradeAnalysis, &format!("t{i}"), JobOptions::default())
                .await
                .unwrap();
        }

        let t0 = Instant::now();
        let handle = pool.start();
        sleep(Duration::from_secs(150)).await;
        handle.shutdown().await;

        let mut starts = handler.starts.lock().unwrap().clone();
        starts.sort();
        assert_eq!(starts.len(), 20);
        assert!(starts.iter().filter(|at| at.duration_since(t0) < Duration::from_secs(60)).count() <= 10);
        for pair in starts.windows(11) {
            assert!(pair[10].duration_since(pair[0]) >= Duration::from_secs(60));
        }

        let counts = store.counts(clock.now()).await.unwrap();
        assert_eq!(counts.completed, 20);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounds_parallel_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(ScriptedHandler::succeeding(Duration::from_secs(5)));
        let producer = JobProducer::new(store.clone(), 3);
        let pool = WorkerPool::new(store.clone(), handler.clone(), unlimited());

        for i in 0..4 {
            producer
                .enqueue(JobKind::TradeAnalysis, &format!("t{i}"), JobOptions::default())
                .await
                .unwrap();
        }

        let handle = pool.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.metrics().snapshot().active_slots, 2);

        sleep(Duration::from_secs(10)).await;
        handle.shutdown().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }
}
