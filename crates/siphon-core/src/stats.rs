use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::job::JobState;
use crate::job_store::JobStore;
use crate::result_store::ResultStore;

/// Point-in-time view over the job store. Best effort, not transactional.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_jobs: u64,
    pub pending: u64,
    pub running: u64,
    pub cancelling: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean of `finished_at - started_at` over COMPLETED jobs.
    pub average_duration_secs: Option<f64>,
    /// Records stored across all jobs.
    pub total_records: u64,
    /// Records of COMPLETED jobs over their summed run time.
    pub records_per_second: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Cancelling => self.cancelling,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Cancelled => self.cancelled,
        }
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> u64 {
        self.pending + self.running + self.cancelling
    }
}

/// Derives [`StatsSnapshot`]s on demand. Read-only.
#[derive(Clone)]
pub struct StatsAggregator<S: JobStore, R: ResultStore> {
    jobs: S,
    results: R,
}

impl<S: JobStore, R: ResultStore> StatsAggregator<S, R> {
    pub fn new(jobs: S, results: R) -> Self {
        Self { jobs, results }
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot, AppError> {
        let mut counts = [0u64; JobState::ALL.len()];
        for (slot, state) in counts.iter_mut().zip(JobState::ALL) {
            *slot = self.jobs.count_by_state(state).await?;
        }
        let [pending, running, cancelling, completed, failed, cancelled] = counts;

        let timings = self.jobs.completed_timings().await?;
        let total_records = self.results.total_count().await?;

        Ok(StatsSnapshot {
            total_jobs: counts.iter().sum(),
            pending,
            running,
            cancelling,
            completed,
            failed,
            cancelled,
            average_duration_secs: timings.average_duration_secs(),
            total_records,
            records_per_second: timings.records_per_second(),
            taken_at: Utc::now(),
        })
    }
}
