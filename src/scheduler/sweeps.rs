// The three periodic sweeps: analysis backfill, payload cleanup, usage summaries

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::{eligible_tiers, SubjectRepository};
use crate::models::summarize_owner;
use crate::queue::jobs::{JobKind, JobOptions, JobPriority};
use crate::queue::producer::JobProducer;
use crate::scheduler::{Sweep, SweepReport};
use crate::utils::{chrono_duration, Clock};

#[derive(Debug, Clone)]
pub struct AnalysisSweepConfig {
    pub lookback: Duration,
    pub batch_cap: usize,
    /// Delay added per position in the batch to spread the work out.
    pub stagger: Duration,
}

impl Default for AnalysisSweepConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(35 * 60),
            batch_cap: 50,
            stagger: Duration::from_secs(2),
        }
    }
}

/// Queues analysis for recent trades that were never analyzed.
pub struct AnalysisSweep {
    repo: Arc<dyn SubjectRepository>,
    producer: JobProducer,
    clock: Arc<dyn Clock>,
    config: AnalysisSweepConfig,
}

impl AnalysisSweep {
    pub fn new(
        repo: Arc<dyn SubjectRepository>,
        producer: JobProducer,
        clock: Arc<dyn Clock>,
        config: AnalysisSweepConfig,
    ) -> Self {
        Self { repo, producer, clock, config }
    }
}

#[async_trait]
impl Sweep for AnalysisSweep {
    fn name(&self) -> &'static str {
        "analysis"
    }

    async fn run(&self) -> anyhow::Result<SweepReport> {
        let created_after = self.clock.now() - chrono_duration(self.config.lookback);
        let trades = self
            .repo
            .find_unanalyzed_trades(created_after, &eligible_tiers(), self.config.batch_cap)
            .await
            .context("Failed to load unanalyzed trades")?;

        let mut report = SweepReport {
            found: trades.len(),
            ..SweepReport::default()
        };

        for (index, trade) in trades.iter().enumerate() {
            let options = JobOptions::default()
                .with_priority(JobPriority::Low)
                .with_delay(self.config.stagger * index as u32);

            match self.producer.enqueue(JobKind::TradeAnalysis, &trade.id, options).await {
                Ok(handle) if handle.created => report.queued += 1,
                Ok(handle) => {
                    debug!(trade_id = %trade.id, job_id = %handle.job_id, "Analysis already queued");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "Failed to queue analysis");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Strips cached provider payloads from old analyses.
pub struct CleanupSweep {
    repo: Arc<dyn SubjectRepository>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl CleanupSweep {
    pub fn new(repo: Arc<dyn SubjectRepository>, clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self { repo, clock, max_age }
    }
}

#[async_trait]
impl Sweep for CleanupSweep {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn run(&self) -> anyhow::Result<SweepReport> {
        let before = self.clock.now() - chrono_duration(self.max_age);
        let stripped = self
            .repo
            .strip_raw_responses(before)
            .await
            .context("Failed to strip cached responses")?;

        Ok(SweepReport {
            found: stripped as usize,
            updated: stripped as usize,
            ..SweepReport::default()
        })
    }
}

/// Recomputes the denormalized per-owner trade summary.
pub struct UsageSweep {
    repo: Arc<dyn SubjectRepository>,
    clock: Arc<dyn Clock>,
}

impl UsageSweep {
    pub fn new(repo: Arc<dyn SubjectRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    async fn refresh_owner(&self, owner_id: &str) -> anyhow::Result<()> {
        let trades = self.repo.trades_for_owner(owner_id).await?;
        let summary = summarize_owner(owner_id, &trades, self.clock.now());
        self.repo.save_owner_summary(&summary).await?;
        Ok(())
    }
}

#[async_trait]
impl Sweep for UsageSweep {
    fn name(&self) -> &'static str {
        "usage"
    }

    async fn run(&self) -> anyhow::Result<SweepReport> {
        let owners = self
            .repo
            .owners_with_trades()
            .await
            .context("Failed to list trade owners")?;

        let mut report = SweepReport {
            found: owners.len(),
            ..SweepReport::default()
        };

        for owner_id in &owners {
            match self.refresh_owner(owner_id).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "Failed to refresh owner summary");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}
