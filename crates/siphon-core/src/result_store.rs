use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{AppendOutcome, ExtractedRecord, SourceRecord};
use crate::pagination::{Page, PageRequest};

/// Append-only, ordered record sequences keyed by job.
///
/// Offsets are assigned at append time, start at zero, and are gap-free.
/// Only the runner bound to a job appends to it, so implementations need
/// at-most-one-writer-per-job safety, but reads may run concurrently.
pub trait ResultStore: Send + Sync + Clone + 'static {
    /// Atomically extend the job's sequence with `records`, in order.
    fn append(
        &self,
        job_id: Uuid,
        records: Vec<SourceRecord>,
    ) -> impl Future<Output = Result<AppendOutcome, AppError>> + Send;

    /// Read records starting at the request's cursor.
    ///
    /// `next_cursor` is `None` when everything written so far has been
    /// returned; the job may still append more later.
    fn page(
        &self,
        job_id: Uuid,
        request: PageRequest,
    ) -> impl Future<Output = Result<Page<ExtractedRecord>, AppError>> + Send;

    /// Number of records stored for the job; the resume position.
    fn count(&self, job_id: Uuid) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Drop every record of the job. Returns how many were removed.
    fn remove(&self, job_id: Uuid) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Records stored across all jobs.
    fn total_count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}
