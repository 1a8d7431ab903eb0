use thiserror::Error;
use uuid::Uuid;

use crate::job::JobState;

/// Application-wide error types for Siphon.
#[derive(Error, Debug)]
pub enum AppError {
    /// No job with this id exists.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// A compare-and-set on job state lost against a concurrent writer,
    /// or the requested edge is not part of the lifecycle.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    /// Admission rejected because the dispatch queue is full.
    #[error("Scheduler overloaded: queue capacity of {capacity} reached")]
    Overloaded { capacity: usize },

    /// Another live job already has an identical spec.
    #[error("Duplicate spec: job {existing} is already active for this spec")]
    DuplicateSpec { existing: Uuid },

    /// A cursor token that this store did not produce.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Removal requested for a job that has not reached a terminal state.
    #[error("Job {job_id} is still {state}")]
    JobActive { job_id: Uuid, state: JobState },

    /// No extraction client is registered for the spec's source.
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    /// The third-party source rejected or failed a page request.
    #[error("Source error{}: {message}", status_code.map(|c| format!(" (HTTP {c})")).unwrap_or_default())]
    SourceError {
        message: String,
        status_code: Option<u16>,
        retryable: bool,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// Inside the runner this is the line between a transient page failure
    /// (retried with backoff) and a fatal one (the job fails).
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::SourceError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Convenience constructor for a transient source failure.
    pub fn transient(message: impl Into<String>) -> Self {
        AppError::SourceError {
            message: message.into(),
            status_code: None,
            retryable: true,
        }
    }

    /// Convenience constructor for a non-retryable source failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        AppError::SourceError {
            message: message.into(),
            status_code: None,
            retryable: false,
        }
    }
}
