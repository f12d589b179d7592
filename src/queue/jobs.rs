// Job definitions for the analysis queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseValueError {
    pub what: &'static str,
    pub value: String,
}

/// What a job analyzes. `TradeAnalysis` jobs point at a trade, the insight
/// kinds point at the trade owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TradeAnalysis,
    OverallInsight,
    WeeklyInsight,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::TradeAnalysis,
        JobKind::OverallInsight,
        JobKind::WeeklyInsight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TradeAnalysis => "trade_analysis",
            JobKind::OverallInsight => "overall_insight",
            JobKind::WeeklyInsight => "weekly_insight",
        }
    }

    /// Stable position in `ALL`, used for per-kind counters.
    pub fn index(&self) -> usize {
        match self {
            JobKind::TradeAnalysis => 0,
            JobKind::OverallInsight => 1,
            JobKind::WeeklyInsight => 2,
        }
    }

    pub fn targets_owner(&self) -> bool {
        !matches!(self, JobKind::TradeAnalysis)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade_analysis" => Ok(JobKind::TradeAnalysis),
            "overall_insight" => Ok(JobKind::OverallInsight),
            "weekly_insight" => Ok(JobKind::WeeklyInsight),
            _ => Err(ParseValueError { what: "job kind", value: s.to_string() }),
        }
    }
}

/// Declaration order is the priority order: `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    /// Dequeue rank, smaller is served first.
    pub fn rank(&self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            _ => Err(ParseValueError { what: "job priority", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(ParseValueError { what: "job state", value: s.to_string() }),
        }
    }
}

/// Deterministic job id for a `(kind, subject)` pair. Duplicate submissions
/// for the same subject collapse onto this id.
pub fn job_id_for(kind: JobKind, subject_id: &str) -> String {
    format!("{}:{}", kind.as_str(), subject_id)
}

/// Caller-side knobs for `JobProducer::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub delay: Option<Duration>,
    pub dedup_key: Option<String>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// A job as handed to a store for insertion.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub kind: JobKind,
    pub subject_id: String,
    pub priority: JobPriority,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub subject_id: String,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Monotonic enqueue order, the FIFO tiebreak within a priority tier.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip_serializing)]
    pub lock_token: Option<String>,
}

impl Job {
    pub fn from_new(new: NewJob, seq: u64) -> Self {
        Self {
            id: new.id,
            kind: new.kind,
            subject_id: new.subject_id,
            priority: new.priority,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: new.max_attempts,
            seq,
            enqueued_at: new.enqueued_at,
            delay_until: new.delay_until,
            claimed_at: None,
            finished_at: None,
            last_error: None,
            lock_token: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.map_or(true, |at| at <= now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn handle(&self, created: bool) -> JobHandle {
        JobHandle {
            job_id: self.id.clone(),
            state: self.state,
            created,
        }
    }
}

/// Returned to producers. `created == false` means an existing non-terminal
/// job absorbed the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub state: JobState,
    pub created: bool,
}
