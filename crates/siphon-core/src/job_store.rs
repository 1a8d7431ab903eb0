use std::future::Future;
use std::time::Duration;

use chrono::TimeDelta;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobSpec, JobState, Transition};
use crate::pagination::{Page, PageRequest};

/// Durable record of jobs and their lifecycle state.
///
/// State only changes through [`transition`](JobStore::transition), an atomic
/// compare-and-set on the current state. Implementations must check the edge
/// with [`validate_edge`] before writing and fill timestamps via
/// [`Job::apply`] semantics.
///
/// Execution is guarded by a per-job lease: a worker may only run a job
/// after [`acquire_lease`](JobStore::acquire_lease) hands it the job, and
/// keeps it by renewing before the lease expires.
pub trait JobStore: Send + Sync + Clone + 'static {
    /// Allocate a new PENDING job.
    ///
    /// Fails with `DuplicateSpec` when the store enforces unique specs and a
    /// non-terminal job with the same fingerprint exists.
    fn create(&self, spec: JobSpec) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Fails with `NotFound` if absent.
    fn get(&self, job_id: Uuid) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Move `job_id` from `from` to `transition.to` if, and only if, its
    /// current state is `from`. Returns the updated job.
    fn transition(
        &self,
        job_id: Uuid,
        from: JobState,
        transition: Transition,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Atomically take or renew the execution lease for `worker_id`,
    /// moving a PENDING job to RUNNING.
    ///
    /// Returns `None` when the job is terminal or another worker holds an
    /// unexpired lease. Fails with `NotFound` if absent.
    fn acquire_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Drop the lease if `worker_id` still holds it. The job keeps its state.
    fn release_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Jobs in creation order, optionally filtered by state.
    fn list(
        &self,
        state: Option<JobState>,
        page: PageRequest,
    ) -> impl Future<Output = Result<Page<Job>, AppError>> + Send;

    /// Remove a terminal job. Fails with `JobActive` otherwise.
    fn delete(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn count_by_state(
        &self,
        state: JobState,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Aggregate timing over COMPLETED jobs.
    fn completed_timings(&self) -> impl Future<Output = Result<CompletedTimings, AppError>> + Send;
}

/// Totals over completed jobs, used for averages and throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletedTimings {
    pub jobs: u64,
    pub total_duration: TimeDelta,
    pub records: u64,
}

impl CompletedTimings {
    pub fn average_duration_secs(&self) -> Option<f64> {
        (self.jobs > 0).then(|| seconds(self.total_duration) / self.jobs as f64)
    }

    pub fn records_per_second(&self) -> Option<f64> {
        let secs = seconds(self.total_duration);
        (self.jobs > 0 && secs > 0.0).then(|| self.records as f64 / secs)
    }
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

/// Lease length as a chrono delta. Out-of-range values clamp to a year.
pub fn lease_delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl)
        .unwrap_or(TimeDelta::days(365))
        .min(TimeDelta::days(365))
}

/// Reject edges that are not part of the lifecycle.
pub fn validate_edge(job_id: Uuid, from: JobState, to: JobState) -> Result<(), AppError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition { job_id, from, to })
    }
}

/// Request cancellation of a job.
///
/// PENDING jobs go straight to CANCELLED; RUNNING jobs move to CANCELLING and
/// are finalized by their runner at the next page boundary. Already
/// cancelling or terminal jobs are returned unchanged. A lost
/// compare-and-set re-reads the job and tries again.
pub async fn request_cancel<S: JobStore>(store: &S, job_id: Uuid) -> Result<Job, AppError> {
    loop {
        let job = store.get(job_id).await?;
        let target = match job.state {
            JobState::Pending => JobState::Cancelled,
            JobState::Running => JobState::Cancelling,
            _ => return Ok(job),
        };

        match store
            .transition(job_id, job.state, Transition::to(target))
            .await
        {
            Ok(updated) => {
                tracing::info!(%job_id, from = %job.state, to = %target, "Cancellation requested");
                return Ok(updated);
            }
            Err(AppError::InvalidTransition { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}
