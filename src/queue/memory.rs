//! In-process job store.
//!
//! Mirrors the Redis store's semantics behind a single mutex. Used for local
//! runs (`--in-memory`) and as the store in pool and scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::queue::jobs::{Job, JobKind, JobState, NewJob};
use crate::queue::store::{
    EnqueueOutcome, JobStore, RetentionPolicy, StallReport, StateCounts, StoreResult, STALLED_ERROR,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    seq: u64,
    /// Finished job ids per (kind, state), oldest first.
    finished: HashMap<(JobKind, JobState), VecDeque<String>>,
}

impl Inner {
    fn owned_active(&mut self, job_id: &str, lock_token: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id).filter(|job| {
            job.state == JobState::Active && job.lock_token.as_deref() == Some(lock_token)
        })
    }

    fn forget_finished(&mut self, job_id: &str) {
        for ids in self.finished.values_mut() {
            ids.retain(|id| id != job_id);
        }
    }

    fn record_finished(&mut self, kind: JobKind, state: JobState, job_id: &str, keep: usize) {
        let ids = self.finished.entry((kind, state)).or_default();
        ids.push_back(job_id.to_string());
        let mut evicted = Vec::new();
        while ids.len() > keep {
            if let Some(old) = ids.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            if self.jobs.get(&old).map_or(false, |job| job.state == state) {
                self.jobs.remove(&old);
            }
        }
    }
}

pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    retention: RetentionPolicy,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> StoreResult<EnqueueOutcome> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.jobs.get(&new.id) {
            if !existing.state.is_terminal() {
                return Ok(EnqueueOutcome { job: existing.clone(), created: false });
            }
        }

        inner.seq += 1;
        let seq = inner.seq;
        inner.forget_finished(&new.id);
        let job = Job::from_new(new, seq);
        inner.jobs.insert(job.id.clone(), job.clone());

        Ok(EnqueueOutcome { job, created: true })
    }

    async fn claim(&self, now: DateTime<Utc>, lock_token: &str) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;

        let next_id = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting && job.is_due(now))
            .min_by_key(|job| (job.priority.rank(), job.seq))
            .map(|job| job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let job = match inner.jobs.get_mut(&id) {
            Some(job) => job,
            None => return Ok(None),
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.claimed_at = Some(now);
        job.delay_until = None;
        job.lock_token = Some(lock_token.to_string());

        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: &str, lock_token: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let kind = match inner.owned_active(job_id, lock_token) {
            Some(job) => {
                job.state = JobState::Completed;
                job.finished_at = Some(now);
                job.lock_token = None;
                job.kind
            }
            None => return Ok(false),
        };
        inner.record_finished(kind, JobState::Completed, job_id, self.retention.completed_per_kind);
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: &str,
        lock_token: &str,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.owned_active(job_id, lock_token) {
            Some(job) => {
                job.state = JobState::Waiting;
                job.delay_until = Some(delay_until);
                job.last_error = Some(error.to_string());
                job.lock_token = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(&self, job_id: &str, lock_token: &str, error: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let kind = match inner.owned_active(job_id, lock_token) {
            Some(job) => {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(error.to_string());
                job.lock_token = None;
                job.kind
            }
            None => return Ok(false),
        };
        inner.record_finished(kind, JobState::Failed, job_id, self.retention.failed_per_kind);
        Ok(true)
    }

    async fn discard(&self, job_id: &str, lock_token: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.owned_active(job_id, lock_token).is_none() {
            return Ok(false);
        }
        inner.jobs.remove(job_id);
        Ok(true)
    }

    async fn reclaim_stalled(&self, active_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<StallReport> {
        let mut inner = self.inner.lock().await;
        let mut report = StallReport::default();
        let mut exhausted = Vec::new();

        for job in inner.jobs.values_mut() {
            let stalled = job.state == JobState::Active
                && job.claimed_at.map_or(true, |at| at < active_before);
            if !stalled {
                continue;
            }

            job.lock_token = None;
            job.last_error = Some(STALLED_ERROR.to_string());
            if job.has_attempts_left() {
                job.state = JobState::Waiting;
                report.requeued.push(job.id.clone());
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                exhausted.push((job.kind, job.id.clone()));
                report.failed.push(job.clone());
            }
        }

        for (kind, id) in exhausted {
            inner.record_finished(kind, JobState::Failed, &id, self.retention.failed_per_kind);
        }

        report.requeued.sort();
        report.failed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(report)
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(job_id).cloned())
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();

        match state {
            JobState::Waiting => jobs.sort_by_key(|job| (job.priority.rank(), job.seq)),
            JobState::Active => jobs.sort_by_key(|job| job.claimed_at),
            JobState::Completed | JobState::Failed => {
                jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at))
            }
        }
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<StateCounts> {
        let inner = self.inner.lock().await;
        let mut counts = StateCounts::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Waiting if job.is_due(now) => counts.waiting += 1,
                JobState::Waiting => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
