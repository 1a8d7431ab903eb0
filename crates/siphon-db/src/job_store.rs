use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use siphon_core::error::AppError;
use siphon_core::job::{Job, JobSpec, JobState, Transition};
use siphon_core::job_store::{CompletedTimings, JobStore, lease_delta, validate_edge};
use siphon_core::pagination::{DEFAULT_MAX_PAGE_SIZE, Page, PageRequest};

/// PostgreSQL-backed job store. State changes are compare-and-set updates
/// guarded by `WHERE state = $from`; execution leases live in the
/// `worker_id` and `lease_expires_at` columns.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
    unique_specs: bool,
    max_page_size: usize,
}

impl PgJobStore {
    /// Store over `pool`. Migrations must already have run.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            unique_specs: false,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Reject `create` while a non-terminal job with the same spec exists.
    pub fn with_unique_specs(mut self) -> Self {
        self.unique_specs = true;
        self
    }

    /// Ceiling for `list` page sizes.
    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source: String,
    params: serde_json::Value,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel_requested: bool,
    record_count: i64,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(AppError::DatabaseError)?;
        Ok(Job {
            id: row.id,
            spec: JobSpec::new(row.source, row.params),
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error: row.error,
            cancel_requested: row.cancel_requested,
            record_count: row.record_count.max(0) as u64,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, source, params, state, created_at, updated_at, started_at, \
                           finished_at, error, cancel_requested, record_count, worker_id, \
                           lease_expires_at";

const ACTIVE_STATES: &str = "('pending', 'running', 'cancelling')";
const TERMINAL_STATES: &str = "('completed', 'failed', 'cancelled')";

fn to_i64(value: u64) -> Result<i64, AppError> {
    i64::try_from(value).map_err(|_| AppError::InvalidCursor(format!("position {value} is out of range")))
}

impl PgJobStore {
    async fn insert(&self, job: &Job, executor: &mut sqlx::PgConnection) -> Result<Job, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO extraction_jobs (id, source, params, spec_hash, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.spec.source)
        .bind(&job.spec.params)
        .bind(job.spec.fingerprint())
        .bind(job.state.as_str())
        .bind(job.created_at)
        .fetch_one(executor)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }

    async fn current_state(&self, job_id: Uuid) -> Result<Option<JobState>, AppError> {
        let state: Option<String> =
            sqlx::query_scalar(r#"SELECT state FROM extraction_jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        state
            .map(|s| s.parse().map_err(AppError::DatabaseError))
            .transpose()
    }
}

impl JobStore for PgJobStore {
    async fn create(&self, spec: JobSpec) -> Result<Job, AppError> {
        let job = Job::new(spec);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if self.unique_specs {
            let fingerprint = job.spec.fingerprint();

            // Serializes concurrent creates of the same spec.
            sqlx::query(r#"SELECT pg_advisory_xact_lock(hashtext($1))"#)
                .bind(&fingerprint)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            let existing: Option<Uuid> = sqlx::query_scalar(&format!(
                r#"
                SELECT id FROM extraction_jobs
                WHERE spec_hash = $1 AND state IN {ACTIVE_STATES}
                ORDER BY seq
                LIMIT 1
                "#
            ))
            .bind(&fingerprint)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            if let Some(existing) = existing {
                return Err(AppError::DuplicateSpec { existing });
            }
        }

        let created = self.insert(&job, &mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(created)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = $1"#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.ok_or(AppError::NotFound(job_id))?.try_into()
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobState,
        transition: Transition,
    ) -> Result<Job, AppError> {
        validate_edge(job_id, from, transition.to)?;

        // Fill the new field values from the current row, then write them
        // only if the state is still `from`. The lease columns are left to
        // their own writers except on terminal states, which clear them.
        let mut job = self.get(job_id).await?;
        if job.state != from {
            return Err(AppError::InvalidTransition {
                job_id,
                from: job.state,
                to: transition.to,
            });
        }
        job.apply(&transition, Utc::now());

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE extraction_jobs
            SET state = $3,
                updated_at = $4,
                started_at = $5,
                finished_at = $6,
                error = $7,
                cancel_requested = $8,
                record_count = $9,
                worker_id = CASE WHEN $10 THEN NULL ELSE worker_id END,
                lease_expires_at = CASE WHEN $10 THEN NULL ELSE lease_expires_at END
            WHERE id = $1 AND state = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(from.as_str())
        .bind(job.state.as_str())
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error)
        .bind(job.cancel_requested)
        .bind(to_i64(job.record_count)?)
        .bind(job.state.is_terminal())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        match row {
            Some(row) => row.try_into(),
            // Lost the race between read and update.
            None => match self.current_state(job_id).await? {
                Some(current) => Err(AppError::InvalidTransition {
                    job_id,
                    from: current,
                    to: transition.to,
                }),
                None => Err(AppError::NotFound(job_id)),
            },
        }
    }

    async fn acquire_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<Job>, AppError> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(lease_delta(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // One statement, so the availability check and the write share the
        // row lock.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE extraction_jobs
            SET state = CASE WHEN state = 'pending' THEN 'running' ELSE state END,
                started_at = COALESCE(started_at, GREATEST($3, created_at)),
                updated_at = GREATEST($3, updated_at),
                worker_id = $2,
                lease_expires_at = $4
            WHERE id = $1
              AND (
                  state = 'pending'
                  OR (
                      state IN ('running', 'cancelling')
                      AND (worker_id IS NULL OR worker_id = $2 OR lease_expires_at <= $3)
                  )
              )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => match self.current_state(job_id).await? {
                Some(_) => Ok(None),
                None => Err(AppError::NotFound(job_id)),
            },
        }
    }

    async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET worker_id = NULL, lease_expires_at = NULL
            WHERE id = $1 AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 && self.current_state(job_id).await?.is_none() {
            return Err(AppError::NotFound(job_id));
        }
        Ok(())
    }

    async fn list(&self, state: Option<JobState>, page: PageRequest) -> Result<Page<Job>, AppError> {
        let offset = page.offset();
        let limit = page.clamped_limit(self.max_page_size);

        // One extra row tells whether another page follows.
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM extraction_jobs
            WHERE ($1::varchar IS NULL OR state = $1)
            ORDER BY seq ASC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(to_i64(offset)?)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let fetched = rows.len() as u64;
        let jobs = rows
            .into_iter()
            .take(limit)
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::from_slice(jobs, offset, offset + fetched))
    }

    async fn delete(&self, job_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(&format!(
            r#"DELETE FROM extraction_jobs WHERE id = $1 AND state IN {TERMINAL_STATES}"#
        ))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.current_state(job_id).await? {
            Some(state) => Err(AppError::JobActive { job_id, state }),
            None => Err(AppError::NotFound(job_id)),
        }
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM extraction_jobs WHERE state = $1"#)
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn completed_timings(&self) -> Result<CompletedTimings, AppError> {
        let (jobs, total_ms, records): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(EXTRACT(EPOCH FROM (finished_at - started_at)) * 1000), 0)::BIGINT,
                COALESCE(SUM(record_count), 0)::BIGINT
            FROM extraction_jobs
            WHERE state = 'completed'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(CompletedTimings {
            jobs: jobs.max(0) as u64,
            total_duration: TimeDelta::milliseconds(total_ms),
            records: records.max(0) as u64,
        })
    }
}
