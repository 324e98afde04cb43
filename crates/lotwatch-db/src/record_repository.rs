use chrono::{DateTime, Utc};
use lotwatch_core::error::AppError;
use lotwatch_core::models::{NormalizedRecord, RecordKind, TargetKey};
use lotwatch_core::traits::RecordStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Narrows [`RecordRepository::list`]; every field is optional.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source: Option<String>,
    pub target_key: Option<TargetKey>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// A persisted record with its row id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: NormalizedRecord,
}

/// Repository for normalized listings and parcels.
///
/// Duplicate detection is delegated to the `(source, external_id,
/// content_hash)` unique constraint: an unchanged record collected twice
/// is rejected as [`AppError::Duplicate`], a changed one is a new row.
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Postgres>,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a record. Returns the new row id.
    pub async fn insert(&self, record: &NormalizedRecord) -> Result<Uuid, AppError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO records
                (source, kind, target_key, external_id, address, price, area_sq_ft,
                 attributes, content_hash, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT ON CONSTRAINT uq_records_identity DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.source)
        .bind(record.kind.as_str())
        .bind(record.target_key.as_str())
        .bind(&record.external_id)
        .bind(&record.address)
        .bind(record.price)
        .bind(record.area_sq_ft)
        .bind(&record.attributes)
        .bind(&record.content_hash)
        .bind(record.collected_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        match row {
            Some((id,)) => Ok(id),
            None => Err(AppError::Duplicate(format!(
                "{}/{}",
                record.source, record.external_id
            ))),
        }
    }

    /// Records matching `filter`, newest first.
    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, AppError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, source, kind, target_key, external_id, address, price, area_sq_ft,
                   attributes, content_hash, collected_at
            FROM records
            WHERE ($1::VARCHAR IS NULL OR source = $1)
              AND ($2::VARCHAR IS NULL OR target_key = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR collected_at >= $3)
            ORDER BY collected_at DESC, id
            LIMIT $4
            "#,
        )
        .bind(&filter.source)
        .bind(filter.target_key.as_ref().map(TargetKey::as_str))
        .bind(filter.since)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(StoredRecord::try_from).collect()
    }

    /// Number of stored records per source.
    pub async fn count_by_source(&self) -> Result<Vec<(String, i64)>, AppError> {
        sqlx::query_as(
            r#"
            SELECT source, COUNT(*)
            FROM records
            GROUP BY source
            ORDER BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    source: String,
    kind: String,
    target_key: String,
    external_id: String,
    address: Option<String>,
    price: Option<i64>,
    area_sq_ft: Option<f64>,
    attributes: serde_json::Value,
    content_hash: String,
    collected_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, AppError> {
        let kind: RecordKind = row.kind.parse().map_err(AppError::DatabaseError)?;
        Ok(StoredRecord {
            id: row.id,
            record: NormalizedRecord {
                source: row.source,
                kind,
                target_key: TargetKey::new(row.target_key),
                external_id: row.external_id,
                address: row.address,
                price: row.price,
                area_sq_ft: row.area_sq_ft,
                attributes: row.attributes,
                content_hash: row.content_hash,
                collected_at: row.collected_at,
            },
        })
    }
}

impl RecordStore for RecordRepository {
    async fn store(&self, record: &NormalizedRecord) -> Result<Uuid, AppError> {
        self.insert(record).await
    }
}
