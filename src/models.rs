use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::queue::jobs::{JobKind, ParseValueError};
use crate::queue::{JobProducer, JobStore, PoolMetrics};
use crate::scheduler::Scheduler;
use crate::utils::Clock;

#[derive(Clone)]
pub struct AppState {
    pub producer: JobProducer,
    pub store: Arc<dyn JobStore>,
    pub metrics: Arc<PoolMetrics>,
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn Clock>,
}

// Trade domain

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl FromStr for TradeSide {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(TradeSide::Long),
            "short" => Ok(TradeSide::Short),
            _ => Err(ParseValueError { what: "trade side", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub owner_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub fees: f64,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Realized profit net of fees. Open trades have none.
pub fn compute_pnl(trade: &Trade) -> Option<f64> {
    let exit = trade.exit_price?;
    let gross = match trade.side {
        TradeSide::Long => (exit - trade.entry_price) * trade.quantity,
        TradeSide::Short => (trade.entry_price - exit) * trade.quantity,
    };
    Some(gross - trade.fees)
}

pub fn compute_status(trade: &Trade) -> TradeStatus {
    if trade.exit_price.is_some() {
        TradeStatus::Closed
    } else {
        TradeStatus::Open
    }
}

// Owners

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Premium,
}

impl SubscriptionTier {
    /// Whether trades of this tier are picked up by the periodic analysis sweep.
    pub fn auto_analysis(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Premium => "premium",
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SubscriptionTier::Free),
            "pro" => Ok(SubscriptionTier::Pro),
            "premium" => Ok(SubscriptionTier::Premium),
            _ => Err(ParseValueError { what: "subscription tier", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub subscription_tier: SubscriptionTier,
    pub usage_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSummary {
    pub owner_id: String,
    pub trade_count: u32,
    pub closed_trade_count: u32,
    pub open_trade_count: u32,
    pub winning_trades: u32,
    pub cumulative_pnl: f64,
    pub computed_at: DateTime<Utc>,
}

pub fn summarize_owner(owner_id: &str, trades: &[Trade], now: DateTime<Utc>) -> OwnerSummary {
    let mut summary = OwnerSummary {
        owner_id: owner_id.to_string(),
        trade_count: trades.len() as u32,
        closed_trade_count: 0,
        open_trade_count: 0,
        winning_trades: 0,
        cumulative_pnl: 0.0,
        computed_at: now,
    };

    for trade in trades {
        match compute_status(trade) {
            TradeStatus::Open => summary.open_trade_count += 1,
            TradeStatus::Closed => summary.closed_trade_count += 1,
        }
        if let Some(pnl) = compute_pnl(trade) {
            summary.cumulative_pnl += pnl;
            if pnl > 0.0 {
                summary.winning_trades += 1;
            }
        }
    }

    summary
}

// Analysis

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            _ => Err(ParseValueError { what: "analysis status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub level: String,
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PsychologyInsights {
    pub emotional_state: String,
    pub biases: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub summary: String,
    pub score: u8,
    pub confidence: u8,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_assessment: RiskAssessment,
    pub psychology_insights: PsychologyInsights,
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub version: String,
    /// Set when the provider reply could not be parsed and the record was
    /// built from the raw text.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

// Subjects: what an analysis job points at

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub kind: JobKind,
    pub id: String,
}

impl SubjectKey {
    pub fn new(kind: JobKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectContext {
    Trade(Trade),
    /// Insight kinds: the owner's trades in scope for the insight.
    Owner { trades: Vec<Trade> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub key: SubjectKey,
    pub owner_id: String,
    pub analysis_status: Option<AnalysisStatus>,
    pub analysis_error: Option<String>,
    /// When the status last changed; the processing lease runs from here.
    pub analysis_updated_at: Option<DateTime<Utc>>,
    pub analysis: Option<AnalysisRecord>,
    pub context: SubjectContext,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub store: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(side: TradeSide, entry: f64, exit: Option<f64>, quantity: f64, fees: f64) -> Trade {
        Trade {
            id: "t1".to_string(),
            owner_id: "u1".to_string(),
            symbol: "AAPL".to_string(),
            side,
            entry_price: entry,
            exit_price: exit,
            quantity,
            fees,
            notes: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_pnl_by_side() {
        assert_eq!(compute_pnl(&trade(TradeSide::Long, 100.0, Some(110.0), 10.0, 5.0)), Some(95.0));
        assert_eq!(compute_pnl(&trade(TradeSide::Short, 100.0, Some(110.0), 10.0, 5.0)), Some(-105.0));
        assert_eq!(compute_pnl(&trade(TradeSide::Long, 100.0, None, 10.0, 5.0)), None);
    }

    #[test]
    fn test_status_follows_exit_price() {
        assert_eq!(compute_status(&trade(TradeSide::Long, 1.0, None, 1.0, 0.0)), TradeStatus::Open);
        assert_eq!(compute_status(&trade(TradeSide::Long, 1.0, Some(2.0), 1.0, 0.0)), TradeStatus::Closed);
    }

    #[test]
    fn test_owner_summary() {
        let trades = vec![
            trade(TradeSide::Long, 100.0, Some(110.0), 1.0, 0.0),
            trade(TradeSide::Long, 100.0, Some(90.0), 1.0, 0.0),
            trade(TradeSide::Short, 50.0, None, 1.0, 0.0),
        ];
        let now = Utc::now();
        let summary = summarize_owner("u1", &trades, now);

        assert_eq!(summary.trade_count, 3);
        assert_eq!(summary.closed_trade_count, 2);
        assert_eq!(summary.open_trade_count, 1);
        assert_eq!(summary.winning_trades, 1);
        assert_eq!(summary.cumulative_pnl, 0.0);
        assert_eq!(summary.computed_at, now);
    }

    #[test]
    fn test_free_tier_is_not_auto_analyzed() {
        assert!(!SubscriptionTier::Free.auto_analysis());
        assert!(SubscriptionTier::Pro.auto_analysis());
        assert!(SubscriptionTier::Premium.auto_analysis());
        assert_eq!("premium".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::Premium);
    }
}
