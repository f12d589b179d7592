use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::queue::jobs::{job_id_for, JobHandle, JobKind, JobOptions, NewJob};
use crate::queue::store::{JobStore, StoreError};
use crate::utils::{chrono_duration, Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("subject id must not be empty")]
    EmptySubject,

    #[error("job store unreachable: {0}")]
    Store(#[from] StoreError),
}

/// Entry point for HTTP handlers, the CLI and the scheduler to submit work.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Submit one unit of work. A waiting or active job with the same id
    /// absorbs the call and its handle is returned with `created == false`.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        subject_id: &str,
        options: JobOptions,
    ) -> Result<JobHandle, ProducerError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(ProducerError::EmptySubject);
        }

        let now = self.clock.now();
        let id = options
            .dedup_key
            .clone()
            .unwrap_or_else(|| job_id_for(kind, subject_id));

        let new_job = NewJob {
            id,
            kind,
            subject_id: subject_id.to_string(),
            priority: options.priority,
            max_attempts: self.max_attempts,
            enqueued_at: now,
            delay_until: options.delay.map(|delay| now + chrono_duration(delay)),
        };

        let outcome = self.store.enqueue(new_job).await.map_err(|e| {
            warn!(kind = %kind, subject_id, error = %e, "Failed to enqueue job");
            ProducerError::Store(e)
        })?;

        if outcome.created {
            info!(
                job_id = %outcome.job.id,
                kind = %kind,
                subject_id,
                priority = %outcome.job.priority,
                delay_ms = options.delay.map(|d| d.as_millis() as u64),
                "Job enqueued"
            );
        } else {
            debug!(job_id = %outcome.job.id, state = %outcome.job.state, "Job already pending, enqueue skipped");
        }

        Ok(outcome.job.handle(outcome.created))
    }
}
