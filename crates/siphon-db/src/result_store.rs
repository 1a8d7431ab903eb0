use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use siphon_core::error::AppError;
use siphon_core::models::{AppendOutcome, ExtractedRecord, SourceRecord};
use siphon_core::pagination::{DEFAULT_MAX_PAGE_SIZE, Page, PageRequest};
use siphon_core::result_store::ResultStore;

/// PostgreSQL-backed result store.
///
/// `extracted_records.seq` is the record offset. Appends lock the parent job
/// row, so offsets stay gap-free even if two writers ever raced.
#[derive(Clone)]
pub struct PgResultStore {
    pool: Pool<Postgres>,
    max_page_size: usize,
}

impl PgResultStore {
    /// Store over `pool`. Migrations must already have run.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Ceiling for `page` sizes.
    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    seq: i64,
    external_id: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for ExtractedRecord {
    fn from(row: RecordRow) -> Self {
        ExtractedRecord {
            offset: row.seq.max(0) as u64,
            external_id: row.external_id,
            data: row.data,
            created_at: row.created_at,
        }
    }
}

impl ResultStore for PgResultStore {
    async fn append(
        &self,
        job_id: Uuid,
        records: Vec<SourceRecord>,
    ) -> Result<AppendOutcome, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let locked: Option<Uuid> =
            sqlx::query_scalar(r#"SELECT id FROM extraction_jobs WHERE id = $1 FOR UPDATE"#)
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        if locked.is_none() {
            return Err(AppError::NotFound(job_id));
        }

        let first: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(MAX(seq) + 1, 0) FROM extracted_records WHERE job_id = $1"#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let len = records.len() as i64;
        if len > 0 {
            let mut seqs = Vec::with_capacity(records.len());
            let mut ids = Vec::with_capacity(records.len());
            let mut data = Vec::with_capacity(records.len());
            for (i, record) in records.into_iter().enumerate() {
                seqs.push(first + i as i64);
                ids.push(record.external_id);
                data.push(record.data);
            }

            sqlx::query(
                r#"
                INSERT INTO extracted_records (job_id, seq, external_id, data)
                SELECT $1, seq, external_id, data
                FROM UNNEST($2::BIGINT[], $3::VARCHAR[], $4::JSONB[]) AS r(seq, external_id, data)
                "#,
            )
            .bind(job_id)
            .bind(&seqs)
            .bind(&ids)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(AppendOutcome {
            first_offset: first as u64,
            len: (first + len) as u64,
        })
    }

    async fn page(
        &self,
        job_id: Uuid,
        request: PageRequest,
    ) -> Result<Page<ExtractedRecord>, AppError> {
        let offset = request.offset();
        let start = i64::try_from(offset)
            .map_err(|_| AppError::InvalidCursor(format!("position {offset} is out of range")))?;
        let limit = request.clamped_limit(self.max_page_size);

        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT seq, external_id, data, created_at
            FROM extracted_records
            WHERE job_id = $1 AND seq >= $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(start)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let fetched = rows.len() as u64;
        let records: Vec<ExtractedRecord> = rows.into_iter().take(limit).map(Into::into).collect();
        Ok(Page::from_slice(records, offset, offset + fetched))
    }

    async fn count(&self, job_id: Uuid) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM extracted_records WHERE job_id = $1"#)
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn remove(&self, job_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(r#"DELETE FROM extracted_records WHERE job_id = $1"#)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn total_count(&self) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM extracted_records"#)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }
}
