pub mod config;
pub mod error;
pub mod job;
pub mod job_store;
pub mod memory;
pub mod models;
pub mod pagination;
pub mod result_store;
pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use error::AppError;
pub use job::{Job, JobSpec, JobState, RetryConfig, Transition};
pub use job_store::{CompletedTimings, JobStore, request_cancel};
pub use memory::{InMemoryJobStore, InMemoryResultStore};
pub use models::{
    AppendOutcome, Continuation, ExtractedRecord, SourceCursor, SourcePage, SourceRecord,
};
pub use pagination::{Cursor, Page, PageRequest};
pub use result_store::ResultStore;
pub use runner::{JobRunner, RunOutcome, RunSignals, RunnerEvent, RunnerReporter, TracingRunnerReporter};
pub use scheduler::{Enqueued, PoolHealth, Scheduler};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use traits::ExtractionClient;
