use chrono::{DateTime, Utc};
use lotwatch_core::campaign::{CampaignOutcome, CampaignResult};
use lotwatch_core::error::AppError;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Summary columns of a stored campaign; the full result is kept as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignRow {
    pub id: Uuid,
    pub strategy: String,
    pub outcome: CampaignOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub keys_attempted: i64,
    pub total_items: i64,
    pub success_ratio: f64,
}

/// Repository for finished campaign results.
#[derive(Clone)]
pub struct CampaignRepository {
    pool: Pool<Postgres>,
}

impl CampaignRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a finished campaign. Saving the same campaign twice is a no-op.
    pub async fn save(&self, result: &CampaignResult) -> Result<(), AppError> {
        let document = serde_json::to_value(result)?;
        sqlx::query(
            r#"
            INSERT INTO campaigns
                (id, strategy, outcome, started_at, finished_at, duration_ms, keys_attempted,
                 total_items, success_ratio, budget_expired, cancelled, resource_exhausted, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(result.campaign_id)
        .bind(result.strategy.as_str())
        .bind(result.outcome.as_str())
        .bind(result.started_at)
        .bind(result.finished_at)
        .bind(to_i64(result.duration_ms))
        .bind(to_i64(result.keys_attempted))
        .bind(to_i64(result.total_items))
        .bind(result.success_ratio)
        .bind(result.budget_expired)
        .bind(result.cancelled)
        .bind(result.resource_exhausted)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(campaign_id = %result.campaign_id, "Campaign result saved");
        Ok(())
    }

    /// Most recent campaigns, newest first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<CampaignRow>, AppError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT id, strategy, outcome, started_at, duration_ms, keys_attempted,
                   total_items, success_ratio
            FROM campaigns
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(CampaignRow::try_from).collect()
    }

    /// The full result of one campaign.
    pub async fn get(&self, id: Uuid) -> Result<Option<CampaignResult>, AppError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT result FROM campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(|(document,)| serde_json::from_value(document).map_err(AppError::from))
            .transpose()
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    strategy: String,
    outcome: String,
    started_at: DateTime<Utc>,
    duration_ms: i64,
    keys_attempted: i64,
    total_items: i64,
    success_ratio: f64,
}

impl TryFrom<SummaryRow> for CampaignRow {
    type Error = AppError;

    fn try_from(row: SummaryRow) -> Result<Self, AppError> {
        let outcome = row
            .outcome
            .parse::<CampaignOutcome>()
            .map_err(|e| AppError::DatabaseError(format!("campaign {}: {e}", row.id)))?;
        Ok(CampaignRow {
            id: row.id,
            strategy: row.strategy,
            outcome,
            started_at: row.started_at,
            duration_ms: row.duration_ms,
            keys_attempted: row.keys_attempted,
            total_items: row.total_items,
            success_ratio: row.success_ratio,
        })
    }
}
