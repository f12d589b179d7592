//! In-process subject repository for `--in-memory` runs and tests.
//!
//! Everything sits behind one mutex, so `begin_processing` is a plain
//! check-and-set under the lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::db::{BeginOutcome, RepoResult, SubjectRepository};
use crate::models::{
    AnalysisRecord, AnalysisStatus, OwnerSummary, Subject, SubjectContext, SubjectKey, SubscriptionTier, Trade, User,
};
use crate::queue::jobs::JobKind;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisState {
    pub status: Option<AnalysisStatus>,
    pub error: Option<String>,
    pub record: Option<AnalysisRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AnalysisState {
    fn is_fresh(&self, fresh_since: DateTime<Utc>) -> bool {
        self.status == Some(AnalysisStatus::Completed)
            && self.record.as_ref().map_or(false, |r| r.generated_at >= fresh_since)
    }

    fn holds_lease(&self, lease_since: DateTime<Utc>) -> bool {
        self.status == Some(AnalysisStatus::Processing) && self.updated_at.map_or(false, |at| at >= lease_since)
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    trades: HashMap<String, (Trade, AnalysisState)>,
    insights: HashMap<(String, JobKind), AnalysisState>,
    summaries: HashMap<String, OwnerSummary>,
}

impl Inner {
    fn subject_exists(&self, key: &SubjectKey) -> bool {
        match key.kind {
            JobKind::TradeAnalysis => self.trades.contains_key(&key.id),
            JobKind::OverallInsight | JobKind::WeeklyInsight => self.users.contains_key(&key.id),
        }
    }

    /// Analysis slot for an existing subject; insight rows are created lazily.
    fn state_mut(&mut self, key: &SubjectKey) -> Option<&mut AnalysisState> {
        match key.kind {
            JobKind::TradeAnalysis => self.trades.get_mut(&key.id).map(|(_, state)| state),
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                if !self.users.contains_key(&key.id) {
                    return None;
                }
                Some(self.insights.entry((key.id.clone(), key.kind)).or_default())
            }
        }
    }

    fn owner_trades(&self, owner_id: &str) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .values()
            .filter(|(trade, _)| trade.owner_id == owner_id)
            .map(|(trade, _)| trade.clone())
            .collect();
        trades.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        trades
    }
}

#[derive(Default)]
pub struct MemorySubjectRepository {
    inner: Mutex<Inner>,
}

impl MemorySubjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_trade(&self, trade: Trade) {
        self.inner
            .lock()
            .await
            .trades
            .insert(trade.id.clone(), (trade, AnalysisState::default()));
    }

    pub async fn analysis_state(&self, key: &SubjectKey) -> Option<AnalysisState> {
        let inner = self.inner.lock().await;
        match key.kind {
            JobKind::TradeAnalysis => inner.trades.get(&key.id).map(|(_, state)| state.clone()),
            _ => inner.insights.get(&(key.id.clone(), key.kind)).cloned(),
        }
    }

    pub async fn usage_count(&self, owner_id: &str) -> Option<i64> {
        self.inner.lock().await.users.get(owner_id).map(|user| user.usage_count)
    }

    pub async fn owner_summary(&self, owner_id: &str) -> Option<OwnerSummary> {
        self.inner.lock().await.summaries.get(owner_id).cloned()
    }
}

#[async_trait]
impl SubjectRepository for MemorySubjectRepository {
    async fn get_subject(&self, key: &SubjectKey) -> RepoResult<Option<Subject>> {
        let inner = self.inner.lock().await;
        let subject = match key.kind {
            JobKind::TradeAnalysis => inner.trades.get(&key.id).map(|(trade, state)| Subject {
                key: key.clone(),
                owner_id: trade.owner_id.clone(),
                analysis_status: state.status,
                analysis_error: state.error.clone(),
                analysis_updated_at: state.updated_at,
                analysis: state.record.clone(),
                context: SubjectContext::Trade(trade.clone()),
            }),
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                if !inner.users.contains_key(&key.id) {
                    return Ok(None);
                }
                let state = inner
                    .insights
                    .get(&(key.id.clone(), key.kind))
                    .cloned()
                    .unwrap_or_default();
                Some(Subject {
                    key: key.clone(),
                    owner_id: key.id.clone(),
                    analysis_status: state.status,
                    analysis_error: state.error,
                    analysis_updated_at: state.updated_at,
                    analysis: state.record,
                    context: SubjectContext::Owner { trades: inner.owner_trades(&key.id) },
                })
            }
        };
        Ok(subject)
    }

    async fn begin_processing(
        &self,
        key: &SubjectKey,
        fresh_since: DateTime<Utc>,
        lease_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<BeginOutcome> {
        let mut inner = self.inner.lock().await;
        if !inner.subject_exists(key) {
            return Ok(BeginOutcome::NotFound);
        }
        let Some(state) = inner.state_mut(key) else {
            return Ok(BeginOutcome::NotFound);
        };

        if state.is_fresh(fresh_since) {
            if let Some(record) = &state.record {
                return Ok(BeginOutcome::Fresh(record.clone()));
            }
        }
        if state.holds_lease(lease_since) {
            return Ok(BeginOutcome::InFlight);
        }

        state.status = Some(AnalysisStatus::Processing);
        state.error = None;
        state.updated_at = Some(now);
        Ok(BeginOutcome::Started)
    }

    async fn set_analysis_status(
        &self,
        key: &SubjectKey,
        status: AnalysisStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.state_mut(key) {
            state.status = Some(status);
            state.error = error.map(str::to_string);
            state.updated_at = Some(now);
        }
        Ok(())
    }

    async fn save_analysis_record(&self, key: &SubjectKey, record: &AnalysisRecord) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.state_mut(key) {
            state.record = Some(record.clone());
        }
        Ok(())
    }

    async fn increment_usage_counter(&self, owner_id: &str) -> RepoResult<()> {
        if let Some(user) = self.inner.lock().await.users.get_mut(owner_id) {
            user.usage_count += 1;
        }
        Ok(())
    }

    async fn find_unanalyzed_trades(
        &self,
        created_after: DateTime<Utc>,
        tiers: &[SubscriptionTier],
        limit: usize,
    ) -> RepoResult<Vec<Trade>> {
        let inner = self.inner.lock().await;
        let mut trades: Vec<Trade> = inner
            .trades
            .values()
            .filter(|(trade, state)| {
                trade.created_at >= created_after
                    && state.status.is_none()
                    && inner
                        .users
                        .get(&trade.owner_id)
                        .map_or(false, |user| tiers.contains(&user.subscription_tier))
            })
            .map(|(trade, _)| trade.clone())
            .collect();
        trades.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn strip_raw_responses(&self, before: DateTime<Utc>) -> RepoResult<u64> {
        let mut inner = self.inner.lock().await;
        let Inner { trades, insights, .. } = &mut *inner;
        let mut stripped = 0;
        let states = trades
            .values_mut()
            .map(|(_, state)| state)
            .chain(insights.values_mut());
        for state in states {
            if let Some(record) = state.record.as_mut() {
                if record.generated_at < before && record.raw_response.take().is_some() {
                    stripped += 1;
                }
            }
        }
        Ok(stripped)
    }

    async fn owners_with_trades(&self) -> RepoResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut owners: Vec<String> = inner.trades.values().map(|(trade, _)| trade.owner_id.clone()).collect();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    async fn trades_for_owner(&self, owner_id: &str) -> RepoResult<Vec<Trade>> {
        Ok(self.inner.lock().await.owner_trades(owner_id))
    }

    async fn save_owner_summary(&self, summary: &OwnerSummary) -> RepoResult<()> {
        self.inner
            .lock()
            .await
            .summaries
            .insert(summary.owner_id.clone(), summary.clone());
        Ok(())
    }
}
