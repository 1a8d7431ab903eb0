use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use siphon_core::error::AppError;

use crate::config::DatabaseConfig;
use crate::job_store::PgJobStore;
use crate::result_store::PgResultStore;

/// Owns the connection pool, runs migrations and hands out the two stores.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    unique_specs: bool,
}

impl Database {
    /// Open a pool from `config`. Does not run migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Connected to PostgreSQL");

        Ok(Self {
            pool,
            unique_specs: config.unique_specs,
        })
    }

    /// Wrap an existing pool (used by the integration tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            unique_specs: false,
        }
    }

    /// Whether handed-out job stores reject duplicate active specs.
    pub fn with_unique_specs(mut self, unique: bool) -> Self {
        self.unique_specs = unique;
        self
    }

    /// Apply the embedded migrations in `migrations/`.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        tracing::debug!("Migrations applied");
        Ok(())
    }

    /// A job store sharing this pool.
    pub fn job_store(&self) -> PgJobStore {
        let store = PgJobStore::new(self.pool.clone());
        if self.unique_specs {
            store.with_unique_specs()
        } else {
            store
        }
    }

    /// A result store sharing this pool.
    pub fn result_store(&self) -> PgResultStore {
        PgResultStore::new(self.pool.clone())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
