// One analysis run: idempotency guard, provider call, persistence

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::analysis::parse::{degraded_record, parse_reply};
use crate::db::{BeginOutcome, RepositoryError, SubjectRepository};
use crate::llm::{AnalysisProvider, ProviderError};
use crate::models::{AnalysisRecord, AnalysisStatus, Subject, SubjectContext, SubjectKey};
use crate::queue::jobs::{Job, JobKind};
use crate::queue::workers::{JobFailure, JobHandler};
use crate::utils::{chrono_duration, Clock, SystemClock};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeout: Duration,
    /// A completed analysis younger than this is reused without a provider call.
    pub freshness_window: Duration,
    /// How long a `processing` mark is honoured before another run may take
    /// over. Must exceed `timeout` and stay below the pool's stall threshold,
    /// so a requeued stalled job finds the dead run's mark expired.
    pub processing_lease: Duration,
    pub weekly_window: Duration,
    pub analysis_version: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            freshness_window: Duration::from_secs(60 * 60),
            processing_lease: Duration::from_secs(90),
            weekly_window: Duration::from_secs(7 * 24 * 60 * 60),
            analysis_version: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Generated(AnalysisRecord),
    /// The reply could not be parsed; a neutral fallback record was stored.
    Degraded(AnalysisRecord),
    /// A fresh analysis already existed.
    Cached(AnalysisRecord),
    /// Another run currently holds the subject.
    InFlight,
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Generated(_) => "generated",
            ExecutionOutcome::Degraded(_) => "degraded",
            ExecutionOutcome::Cached(_) => "cached",
            ExecutionOutcome::InFlight => "in_flight",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("subject {0} not found")]
    NotFound(SubjectKey),

    #[error("provider rejected the request: {0}")]
    ProviderBadRequest(ProviderError),

    #[error("provider unavailable: {0}")]
    ProviderTransient(ProviderError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::ProviderTransient(_) | ExecutorError::Repository(_))
    }
}

impl From<ProviderError> for ExecutorError {
    fn from(err: ProviderError) -> Self {
        if err.is_retryable() {
            ExecutorError::ProviderTransient(err)
        } else {
            ExecutorError::ProviderBadRequest(err)
        }
    }
}

pub struct AnalysisExecutor {
    repo: Arc<dyn SubjectRepository>,
    provider: Arc<dyn AnalysisProvider>,
    config: ExecutorConfig,
    clock: Arc<dyn Clock>,
}

impl AnalysisExecutor {
    pub fn new(repo: Arc<dyn SubjectRepository>, provider: Arc<dyn AnalysisProvider>, config: ExecutorConfig) -> Self {
        Self {
            repo,
            provider,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn execute(&self, key: &SubjectKey) -> Result<ExecutionOutcome, ExecutorError> {
        let subject = self
            .repo
            .get_subject(key)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(key.clone()))?;

        let now = self.clock.now();
        let fresh_since = now - chrono_duration(self.config.freshness_window);
        let lease_since = now - chrono_duration(self.config.processing_lease);

        match self.repo.begin_processing(key, fresh_since, lease_since, now).await? {
            BeginOutcome::Started => {}
            BeginOutcome::Fresh(record) => {
                debug!(subject = %key, generated_at = %record.generated_at, "Fresh analysis exists, skipping");
                return Ok(ExecutionOutcome::Cached(record));
            }
            BeginOutcome::InFlight => {
                debug!(subject = %key, "Analysis already in progress, skipping");
                return Ok(ExecutionOutcome::InFlight);
            }
            BeginOutcome::NotFound => return Err(ExecutorError::NotFound(key.clone())),
        }

        match self.generate_and_store(&subject).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.release(key, &err).await;
                Err(err)
            }
        }
    }

    async fn generate_and_store(&self, subject: &Subject) -> Result<ExecutionOutcome, ExecutorError> {
        let key = &subject.key;
        let scoped = self.scope(subject);

        let reply = match tokio::time::timeout(self.config.timeout, self.provider.generate(&scoped)).await {
            Ok(reply) => reply?,
            Err(_) => return Err(ProviderError::Timeout(self.config.timeout).into()),
        };

        let generated_at = self.clock.now();
        let outcome = match parse_reply(&reply.content, &reply.model, &self.config.analysis_version, generated_at) {
            Ok(record) => ExecutionOutcome::Generated(record),
            Err(e) => {
                warn!(subject = %key, error = %e, "Unparseable analysis reply, storing degraded record");
                ExecutionOutcome::Degraded(degraded_record(
                    &reply.content,
                    &reply.model,
                    &self.config.analysis_version,
                    generated_at,
                ))
            }
        };

        let record = match &outcome {
            ExecutionOutcome::Generated(record) | ExecutionOutcome::Degraded(record) => record,
            ExecutionOutcome::Cached(_) | ExecutionOutcome::InFlight => return Ok(outcome),
        };

        self.repo.save_analysis_record(key, record).await?;
        self.repo
            .set_analysis_status(key, AnalysisStatus::Completed, None, self.clock.now())
            .await?;
        self.repo.increment_usage_counter(&subject.owner_id).await?;

        info!(
            subject = %key,
            owner_id = %subject.owner_id,
            score = record.score,
            degraded = record.degraded,
            model = %record.model,
            "Analysis stored"
        );
        Ok(outcome)
    }

    /// Weekly insights only look at the trailing window of trades.
    fn scope(&self, subject: &Subject) -> Subject {
        let mut scoped = subject.clone();
        if subject.key.kind == JobKind::WeeklyInsight {
            let since = self.clock.now() - chrono_duration(self.config.weekly_window);
            if let SubjectContext::Owner { trades } = &mut scoped.context {
                trades.retain(|trade| trade.created_at >= since);
            }
        }
        scoped
    }

    /// Drop the processing mark after a failed run. Terminal failures are
    /// final; anything retryable goes back to `pending` for the next attempt.
    async fn release(&self, key: &SubjectKey, err: &ExecutorError) {
        let status = if err.is_retryable() {
            AnalysisStatus::Pending
        } else {
            AnalysisStatus::Failed
        };
        let message = err.to_string();
        if let Err(e) = self
            .repo
            .set_analysis_status(key, status, Some(&message), self.clock.now())
            .await
        {
            error!(subject = %key, error = %e, "Failed to reset analysis status");
        }
    }
}

#[async_trait]
impl JobHandler for AnalysisExecutor {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let key = SubjectKey::new(job.kind, job.subject_id.clone());
        match self.execute(&key).await {
            Ok(ExecutionOutcome::InFlight) => Err(JobFailure::retry_after(
                "analysis in flight",
                self.config.processing_lease,
            )),
            Ok(outcome) => {
                debug!(job_id = %job.id, attempt = job.attempts, outcome = outcome.label(), "Analysis job finished");
                Ok(())
            }
            Err(err @ ExecutorError::NotFound(_)) => Err(JobFailure::discard(err.to_string())),
            Err(err) if err.is_retryable() => Err(JobFailure::retry(err.to_string())),
            Err(err) => Err(JobFailure::fail(err.to_string())),
        }
    }

    async fn on_exhausted(&self, job: &Job, failure: &JobFailure) {
        let key = SubjectKey::new(job.kind, job.subject_id.clone());
        if let Err(e) = self
            .repo
            .set_analysis_status(&key, AnalysisStatus::Failed, Some(&failure.message), self.clock.now())
            .await
        {
            error!(job_id = %job.id, subject = %key, error = %e, "Failed to mark analysis failed");
        }
    }
}
