// Test doubles shared across module tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::llm::{AnalysisProvider, ProviderError, ProviderReply};
use crate::models::{Subject, SubscriptionTier, Trade, TradeSide, User};

use crate::queue::jobs::{Job, JobState, NewJob};
use crate::queue::memory::MemoryJobStore;
use crate::queue::store::{EnqueueOutcome, JobStore, StallReport, StateCounts, StoreError, StoreResult};

/// Memory store whose Nth `enqueue` calls (1-based) fail as if Redis were down.
pub struct FlakyJobStore {
    inner: MemoryJobStore,
    failing: HashSet<usize>,
    enqueues: AtomicUsize,
}

impl FlakyJobStore {
    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            failing: calls.iter().copied().collect(),
            enqueues: AtomicUsize::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn enqueue(&self, job: NewJob) -> StoreResult<EnqueueOutcome> {
        let call = self.enqueues.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.enqueue(job).await
    }

    async fn claim(&self, now: DateTime<Utc>, lock_token: &str) -> StoreResult<Option<Job>> {
        self.inner.claim(now, lock_token).await
    }

    async fn complete(&self, job_id: &str, lock_token: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.complete(job_id, lock_token, now).await
    }

    async fn retry(
        &self,
        job_id: &str,
        lock_token: &str,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        self.inner.retry(job_id, lock_token, delay_until, error).await
    }

    async fn fail(&self, job_id: &str, lock_token: &str, error: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.fail(job_id, lock_token, error, now).await
    }

    async fn discard(&self, job_id: &str, lock_token: &str) -> StoreResult<bool> {
        self.inner.discard(job_id, lock_token).await
    }

    async fn reclaim_stalled(&self, active_before: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<StallReport> {
        self.inner.reclaim_stalled(active_before, now).await
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> StoreResult<Vec<Job>> {
        self.inner.list_by_state(state, limit).await
    }

    async fn counts(&self, now: DateTime<Utc>) -> StoreResult<StateCounts> {
        self.inner.counts(now).await
    }
}

/// Provider that plays back scripted replies; the last one repeats.
pub struct StubProvider {
    replies: Mutex<VecDeque<Result<ProviderReply, ProviderError>>>,
    last: Mutex<Option<Result<ProviderReply, ProviderError>>>,
    latency: Duration,
    calls: AtomicUsize,
    subjects: Mutex<Vec<Subject>>,
}

impl StubProvider {
    pub fn scripted(replies: Vec<Result<ProviderReply, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            subjects: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(content: &str) -> Self {
        Self::scripted(vec![Ok(reply(content))])
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_subjects(&self) -> Vec<Subject> {
        self.subjects.lock().unwrap().clone()
    }
}

pub fn reply(content: &str) -> ProviderReply {
    ProviderReply {
        content: content.to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}

#[async_trait]
impl AnalysisProvider for StubProvider {
    async fn generate(&self, subject: &Subject) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.subjects.lock().unwrap().push(subject.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("no scripted reply".to_string())))
    }
}

pub fn user(id: &str, tier: SubscriptionTier) -> User {
    User {
        id: id.to_string(),
        subscription_tier: tier,
        usage_count: 0,
    }
}

pub fn trade(id: &str, owner_id: &str, created_at: DateTime<Utc>) -> Trade {
    Trade {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        symbol: "ES".to_string(),
        side: TradeSide::Long,
        entry_price: 5000.0,
        exit_price: Some(5010.0),
        quantity: 1.0,
        fees: 2.5,
        notes: None,
        created_at,
        closed_at: Some(created_at),
    }
}
