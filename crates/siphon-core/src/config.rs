use std::time::Duration;

use crate::error::AppError;
use crate::job::RetryConfig;
use crate::pagination::DEFAULT_MAX_PAGE_SIZE;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Runtime configuration for the scheduler and its runners.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool (number of WorkerSlots).
    pub workers: usize,
    /// Maximum queued jobs before `submit` fails with `Overloaded`.
    /// `None` queues without limit.
    pub queue_capacity: Option<usize>,
    pub retry: RetryConfig,
    /// Ceiling applied to every requested page size.
    pub max_page_size: usize,
    /// How long `health()` waits for the dispatch lock.
    pub health_timeout: Duration,
    /// Execution lease length. A runner renews at every page boundary; a
    /// job whose holder stops renewing may be resumed by another scheduler
    /// once this elapses.
    pub lease_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: None,
            retry: RetryConfig::default(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            health_timeout: Duration::from_millis(250),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl EngineConfig {
    /// Read configuration from environment variables.
    ///
    /// - `SIPHON_WORKERS` (optional, defaults to 4, must be at least 1)
    /// - `SIPHON_QUEUE_CAPACITY` (optional, unbounded when unset)
    /// - `SIPHON_FETCH_MAX_RETRIES` (optional, defaults to 3)
    /// - `SIPHON_FETCH_BACKOFF_MS` (optional, defaults to 200)
    /// - `SIPHON_FETCH_MAX_BACKOFF_MS` (optional, defaults to 5000)
    /// - `SIPHON_LEASE_SECS` (optional, defaults to 120, must be at least 1)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let workers = parse_var(&lookup, "SIPHON_WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(AppError::ConfigError(
                "SIPHON_WORKERS must be at least 1".into(),
            ));
        }

        let queue_capacity = parse_var(&lookup, "SIPHON_QUEUE_CAPACITY")?;

        let max_retries = parse_var(&lookup, "SIPHON_FETCH_MAX_RETRIES")?
            .unwrap_or(defaults.retry.max_retries);
        let base_delay = parse_var(&lookup, "SIPHON_FETCH_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_delay);
        let max_delay = parse_var(&lookup, "SIPHON_FETCH_MAX_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.max_delay);
        if max_delay < base_delay {
            return Err(AppError::ConfigError(format!(
                "SIPHON_FETCH_MAX_BACKOFF_MS ({}) is below SIPHON_FETCH_BACKOFF_MS ({})",
                max_delay.as_millis(),
                base_delay.as_millis()
            )));
        }

        let lease_secs = parse_var(&lookup, "SIPHON_LEASE_SECS")?
            .unwrap_or(defaults.lease_ttl.as_secs());
        if lease_secs == 0 {
            return Err(AppError::ConfigError(
                "SIPHON_LEASE_SECS must be at least 1".into(),
            ));
        }

        Ok(Self {
            workers,
            queue_capacity,
            lease_ttl: Duration::from_secs(lease_secs),
            retry: RetryConfig {
                max_retries,
                base_delay,
                max_delay,
            },
            ..defaults
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {key} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}
