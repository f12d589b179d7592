use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::jobs::{Job, JobState, NewJob};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True when the backing service could not be reached at all, as opposed
    /// to a malformed record or a script error.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            StoreError::Unavailable(_) => true,
            StoreError::Corrupt { .. } => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How many finished job records are kept per kind before the oldest are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_per_kind: usize,
    pub failed_per_kind: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_per_kind: 100,
            failed_per_kind: 50,
        }
    }
}

impl RetentionPolicy {
    pub fn keep(&self, state: JobState) -> usize {
        match state {
            JobState::Completed => self.completed_per_kind,
            JobState::Failed => self.failed_per_kind,
            JobState::Waiting | JobState::Active => usize::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job: Job,
    pub created: bool,
}

/// Queue depth by state. `waiting` counts jobs eligible now, `delayed` the
/// waiting jobs whose delay has not elapsed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StallReport {
    /// Ids returned to `waiting` with attempts to spare.
    pub requeued: Vec<String>,
    /// Out of attempts, moved to `failed`. Full records so the handler can
    /// settle the subject.
    pub failed: Vec<Job>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

pub const STALLED_ERROR: &str = "job stalled: worker stopped responding";

/// Durable job storage. Claims are atomic: a job is handed to at most one
/// lock token at a time, and completion/retry/failure calls are rejected
/// (return `false`) when the caller's token no longer owns the job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job unless one with the same id is waiting or active.
    async fn enqueue(&self, job: NewJob) -> StoreResult<EnqueueOutcome>;

    /// Claim the highest-priority due job (FIFO within a tier), mark it active
    /// and bump its attempt counter.
    async fn claim(&self, now: DateTime<Utc>, lock_token: &str) -> StoreResult<Option<Job>>;

    async fn complete(&self, job_id: &str, lock_token: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Put an active job back to `waiting`, not eligible before `delay_until`.
    async fn retry(
        &self,
        job_id: &str,
        lock_token: &str,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool>;

    async fn fail(&self, job_id: &str, lock_token: &str, error: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Drop an active job without keeping a record.
    async fn discard(&self, job_id: &str, lock_token: &str) -> StoreResult<bool>;

    /// Release jobs that have been active since before `active_before`.
    async fn reclaim_stalled(&self, active_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<StallReport>;

    async fn get(&self, job_id: &str) -> StoreResult<Option<Job>>;

    async fn list_by_state(&self, state: JobState, limit: usize) -> StoreResult<Vec<Job>>;

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<StateCounts>;
}
