// Postgres-backed subject repository
// Note: runtime query/query_as throughout so the crate builds without DATABASE_URL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::db::{BeginOutcome, RepoResult, RepositoryError, SubjectRepository};
use crate::models::{
    AnalysisRecord, AnalysisStatus, OwnerSummary, Subject, SubjectContext, SubjectKey, SubscriptionTier, Trade,
};
use crate::queue::jobs::JobKind;

const TRADE_COLUMNS: &str = "id, owner_id, symbol, side, entry_price, exit_price, quantity, fees, notes, created_at, closed_at";

#[derive(Clone)]
pub struct PgSubjectRepository {
    pool: PgPool,
}

#[derive(FromRow)]
struct TradeRow {
    id: String,
    owner_id: String,
    symbol: String,
    side: String,
    entry_price: f64,
    exit_price: Option<f64>,
    quantity: f64,
    fees: f64,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = RepositoryError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: row.id,
            owner_id: row.owner_id,
            symbol: row.symbol,
            side: row.side.parse()?,
            entry_price: row.entry_price,
            exit_price: row.exit_price,
            quantity: row.quantity,
            fees: row.fees,
            notes: row.notes,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}

#[derive(FromRow)]
struct AnalysisRow {
    analysis_status: Option<String>,
    analysis_error: Option<String>,
    analysis: Option<Json<AnalysisRecord>>,
    analysis_generated_at: Option<DateTime<Utc>>,
    analysis_updated_at: Option<DateTime<Utc>>,
}

impl AnalysisRow {
    fn status(&self) -> RepoResult<Option<AnalysisStatus>> {
        self.analysis_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(RepositoryError::from)
    }

    fn is_fresh(&self, fresh_since: DateTime<Utc>) -> RepoResult<bool> {
        Ok(self.status()? == Some(AnalysisStatus::Completed)
            && self.analysis.is_some()
            && self.analysis_generated_at.map_or(false, |at| at >= fresh_since))
    }
}

impl PgSubjectRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn analysis_row(&self, key: &SubjectKey) -> RepoResult<Option<AnalysisRow>> {
        let row = match key.kind {
            JobKind::TradeAnalysis => {
                sqlx::query_as::<_, AnalysisRow>(
                    r#"
                    SELECT analysis_status, analysis_error, analysis, analysis_generated_at, analysis_updated_at
                    FROM trades WHERE id = $1
                    "#,
                )
                .bind(&key.id)
                .fetch_optional(&self.pool)
                .await?
            }
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                let owner_exists = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE id = $1")
                    .bind(&key.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .is_some();
                if !owner_exists {
                    return Ok(None);
                }

                let row = sqlx::query_as::<_, AnalysisRow>(
                    r#"
                    SELECT analysis_status, analysis_error, analysis, analysis_generated_at, analysis_updated_at
                    FROM owner_insights WHERE owner_id = $1 AND kind = $2
                    "#,
                )
                .bind(&key.id)
                .bind(key.kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

                Some(row.unwrap_or(AnalysisRow {
                    analysis_status: None,
                    analysis_error: None,
                    analysis: None,
                    analysis_generated_at: None,
                    analysis_updated_at: None,
                }))
            }
        };
        Ok(row)
    }
}

#[async_trait]
impl SubjectRepository for PgSubjectRepository {
    async fn get_subject(&self, key: &SubjectKey) -> RepoResult<Option<Subject>> {
        let (owner_id, context) = match key.kind {
            JobKind::TradeAnalysis => {
                let row = sqlx::query_as::<_, TradeRow>(&format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = $1"))
                    .bind(&key.id)
                    .fetch_optional(&self.pool)
                    .await?;
                match row {
                    Some(row) => {
                        let trade = Trade::try_from(row)?;
                        (trade.owner_id.clone(), SubjectContext::Trade(trade))
                    }
                    None => return Ok(None),
                }
            }
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                let trades = self.trades_for_owner(&key.id).await?;
                (key.id.clone(), SubjectContext::Owner { trades })
            }
        };

        let Some(analysis) = self.analysis_row(key).await? else {
            return Ok(None);
        };

        Ok(Some(Subject {
            key: key.clone(),
            owner_id,
            analysis_status: analysis.status()?,
            analysis_error: analysis.analysis_error,
            analysis_updated_at: analysis.analysis_updated_at,
            analysis: analysis.analysis.map(|json| json.0),
            context,
        }))
    }

    async fn begin_processing(
        &self,
        key: &SubjectKey,
        fresh_since: DateTime<Utc>,
        lease_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<BeginOutcome> {
        let claimed = match key.kind {
            JobKind::TradeAnalysis => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    UPDATE trades
                    SET analysis_status = 'processing', analysis_error = NULL, analysis_updated_at = $2
                    WHERE id = $1
                      AND NOT COALESCE(analysis_status = 'completed' AND analysis IS NOT NULL AND analysis_generated_at >= $3, FALSE)
                      AND NOT COALESCE(analysis_status = 'processing' AND analysis_updated_at >= $4, FALSE)
                    RETURNING id
                    "#,
                )
                .bind(&key.id)
                .bind(now)
                .bind(fresh_since)
                .bind(lease_since)
                .fetch_optional(&self.pool)
                .await?
            }
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                let owner_exists = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE id = $1")
                    .bind(&key.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .is_some();
                if !owner_exists {
                    return Ok(BeginOutcome::NotFound);
                }

                sqlx::query_scalar::<_, String>(
                    r#"
                    INSERT INTO owner_insights (owner_id, kind, analysis_status, analysis_updated_at)
                    VALUES ($1, $2, 'processing', $3)
                    ON CONFLICT (owner_id, kind) DO UPDATE
                    SET analysis_status = 'processing', analysis_error = NULL, analysis_updated_at = $3
                    WHERE NOT COALESCE(owner_insights.analysis_status = 'completed' AND owner_insights.analysis IS NOT NULL AND owner_insights.analysis_generated_at >= $4, FALSE)
                      AND NOT COALESCE(owner_insights.analysis_status = 'processing' AND owner_insights.analysis_updated_at >= $5, FALSE)
                    RETURNING owner_id
                    "#,
                )
                .bind(&key.id)
                .bind(key.kind.as_str())
                .bind(now)
                .bind(fresh_since)
                .bind(lease_since)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        if claimed.is_some() {
            return Ok(BeginOutcome::Started);
        }

        // Lost the compare-and-set: report why.
        match self.analysis_row(key).await? {
            None => Ok(BeginOutcome::NotFound),
            Some(row) if row.is_fresh(fresh_since)? => match row.analysis {
                Some(record) => Ok(BeginOutcome::Fresh(record.0)),
                None => Ok(BeginOutcome::InFlight),
            },
            Some(_) => Ok(BeginOutcome::InFlight),
        }
    }

    async fn set_analysis_status(
        &self,
        key: &SubjectKey,
        status: AnalysisStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        match key.kind {
            JobKind::TradeAnalysis => {
                sqlx::query(
                    "UPDATE trades SET analysis_status = $2, analysis_error = $3, analysis_updated_at = $4 WHERE id = $1",
                )
                .bind(&key.id)
                .bind(status.as_str())
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                sqlx::query(
                    r#"
                    INSERT INTO owner_insights (owner_id, kind, analysis_status, analysis_error, analysis_updated_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (owner_id, kind) DO UPDATE
                    SET analysis_status = $3, analysis_error = $4, analysis_updated_at = $5
                    "#,
                )
                .bind(&key.id)
                .bind(key.kind.as_str())
                .bind(status.as_str())
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn save_analysis_record(&self, key: &SubjectKey, record: &AnalysisRecord) -> RepoResult<()> {
        match key.kind {
            JobKind::TradeAnalysis => {
                sqlx::query("UPDATE trades SET analysis = $2, analysis_generated_at = $3 WHERE id = $1")
                    .bind(&key.id)
                    .bind(Json(record))
                    .bind(record.generated_at)
                    .execute(&self.pool)
                    .await?;
            }
            JobKind::OverallInsight | JobKind::WeeklyInsight => {
                sqlx::query(
                    r#"
                    INSERT INTO owner_insights (owner_id, kind, analysis, analysis_generated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (owner_id, kind) DO UPDATE
                    SET analysis = $3, analysis_generated_at = $4
                    "#,
                )
                .bind(&key.id)
                .bind(key.kind.as_str())
                .bind(Json(record))
                .bind(record.generated_at)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn increment_usage_counter(&self, owner_id: &str) -> RepoResult<()> {
        sqlx::query("UPDATE users SET usage_count = usage_count + 1 WHERE id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_unanalyzed_trades(
        &self,
        created_after: DateTime<Utc>,
        tiers: &[SubscriptionTier],
        limit: usize,
    ) -> RepoResult<Vec<Trade>> {
        let tiers: Vec<String> = tiers.iter().map(|tier| tier.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT t.id, t.owner_id, t.symbol, t.side, t.entry_price, t.exit_price, t.quantity, t.fees,
                   t.notes, t.created_at, t.closed_at
            FROM trades t
            JOIN users u ON u.id = t.owner_id
            WHERE t.created_at >= $1
              AND t.analysis_status IS NULL
              AND u.subscription_tier = ANY($2)
            ORDER BY t.created_at ASC
            LIMIT $3
            "#,
        )
        .bind(created_after)
        .bind(&tiers)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn strip_raw_responses(&self, before: DateTime<Utc>) -> RepoResult<u64> {
        let trades = sqlx::query(
            r#"
            UPDATE trades SET analysis = analysis - 'rawResponse'
            WHERE analysis_generated_at < $1 AND analysis->>'rawResponse' IS NOT NULL
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        let insights = sqlx::query(
            r#"
            UPDATE owner_insights SET analysis = analysis - 'rawResponse'
            WHERE analysis_generated_at < $1 AND analysis->>'rawResponse' IS NOT NULL
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(trades.rows_affected() + insights.rows_affected())
    }

    async fn owners_with_trades(&self) -> RepoResult<Vec<String>> {
        let owners = sqlx::query_scalar::<_, String>("SELECT DISTINCT owner_id FROM trades ORDER BY owner_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(owners)
    }

    async fn trades_for_owner(&self, owner_id: &str) -> RepoResult<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE owner_id = $1 ORDER BY created_at ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn save_owner_summary(&self, summary: &OwnerSummary) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO owner_summaries
                (owner_id, trade_count, closed_trade_count, open_trade_count, winning_trades, cumulative_pnl, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (owner_id) DO UPDATE
            SET trade_count = $2, closed_trade_count = $3, open_trade_count = $4,
                winning_trades = $5, cumulative_pnl = $6, computed_at = $7
            "#,
        )
        .bind(&summary.owner_id)
        .bind(summary.trade_count as i32)
        .bind(summary.closed_trade_count as i32)
        .bind(summary.open_trade_count as i32)
        .bind(summary.winning_trades as i32)
        .bind(summary.cumulative_pnl)
        .bind(summary.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
