// Subject persistence: trades, owner insights and owner summaries

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AnalysisRecord, AnalysisStatus, OwnerSummary, Subject, SubjectKey, SubscriptionTier, Trade};

pub mod memory;
pub mod operations;
pub mod pool;

pub use memory::MemorySubjectRepository;
pub use operations::PgSubjectRepository;
pub use pool::*;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    Invalid(String),
}

impl From<crate::queue::jobs::ParseValueError> for RepositoryError {
    fn from(err: crate::queue::jobs::ParseValueError) -> Self {
        RepositoryError::Invalid(err.to_string())
    }
}

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

/// Result of the compare-and-set that guards an analysis run.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Status moved to `processing`; the caller owns the run.
    Started,
    /// A completed analysis newer than the freshness cutoff exists.
    Fresh(AnalysisRecord),
    /// Another run holds a live processing mark.
    InFlight,
    NotFound,
}

#[async_trait]
pub trait SubjectRepository: Send + Sync {
    async fn get_subject(&self, key: &SubjectKey) -> RepoResult<Option<Subject>>;

    /// Atomically decide whether a run is needed and, if so, mark the subject
    /// `processing`. Completed analyses generated at or after `fresh_since`
    /// are returned as-is; processing marks set at or after `lease_since` are
    /// respected, older ones are taken over.
    async fn begin_processing(
        &self,
        key: &SubjectKey,
        fresh_since: DateTime<Utc>,
        lease_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<BeginOutcome>;

    async fn set_analysis_status(
        &self,
        key: &SubjectKey,
        status: AnalysisStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<()>;

    async fn save_analysis_record(&self, key: &SubjectKey, record: &AnalysisRecord) -> RepoResult<()>;

    async fn increment_usage_counter(&self, owner_id: &str) -> RepoResult<()>;

    /// Trades created at or after `created_after` that were never analyzed and
    /// whose owner is on one of `tiers`, oldest first.
    async fn find_unanalyzed_trades(
        &self,
        created_after: DateTime<Utc>,
        tiers: &[SubscriptionTier],
        limit: usize,
    ) -> RepoResult<Vec<Trade>>;

    /// Drop cached provider payloads from analyses generated before `before`.
    /// Returns the number of analyses touched.
    async fn strip_raw_responses(&self, before: DateTime<Utc>) -> RepoResult<u64>;

    async fn owners_with_trades(&self) -> RepoResult<Vec<String>>;

    async fn trades_for_owner(&self, owner_id: &str) -> RepoResult<Vec<Trade>>;

    async fn save_owner_summary(&self, summary: &OwnerSummary) -> RepoResult<()>;
}

pub fn eligible_tiers() -> Vec<SubscriptionTier> {
    [SubscriptionTier::Free, SubscriptionTier::Pro, SubscriptionTier::Premium]
        .into_iter()
        .filter(|tier| tier.auto_analysis())
        .collect()
}
