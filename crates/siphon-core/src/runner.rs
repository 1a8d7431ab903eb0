use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DEFAULT_LEASE_TTL;
use crate::error::AppError;
use crate::job::{Job, JobSpec, JobState, RetryConfig, Transition};
use crate::job_store::JobStore;
use crate::models::{Continuation, SourceCursor, SourcePage};
use crate::result_store::ResultStore;
use crate::traits::ExtractionClient;

/// Events emitted by the runner and scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunnerEvent<'a> {
    WorkerStarted {
        slot: usize,
    },
    JobQueued {
        job_id: Uuid,
        depth: usize,
    },
    JobAssigned {
        job_id: Uuid,
        slot: usize,
    },
    JobSkipped {
        job_id: Uuid,
        state: JobState,
        /// Lease holder, when another worker owns the job.
        holder: Option<&'a str>,
    },
    JobStarted {
        job_id: Uuid,
        resume_offset: u64,
    },
    PageAppended {
        job_id: Uuid,
        records: usize,
        len: u64,
    },
    FetchRetrying {
        job_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    JobCompleted {
        job_id: Uuid,
        records: u64,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
    },
    JobCancelled {
        job_id: Uuid,
        records: u64,
    },
    JobSuspended {
        job_id: Uuid,
        records: u64,
    },
    JobAbandoned {
        job_id: Uuid,
        reason: &'a str,
    },
    JobRequeued {
        job_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    WorkerStopped {
        slot: usize,
    },
}

/// Trait for receiving runner events (decoupled logging).
pub trait RunnerReporter: Send + Sync {
    fn report(&self, event: RunnerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunnerReporter;

impl RunnerReporter for TracingRunnerReporter {
    fn report(&self, event: RunnerEvent<'_>) {
        match event {
            RunnerEvent::WorkerStarted { slot } => {
                tracing::debug!(%slot, "Worker started");
            }
            RunnerEvent::JobQueued { job_id, depth } => {
                tracing::info!(%job_id, %depth, "Job queued");
            }
            RunnerEvent::JobAssigned { job_id, slot } => {
                tracing::info!(%job_id, %slot, "Job assigned to worker slot");
            }
            RunnerEvent::JobSkipped {
                job_id,
                state,
                holder,
            } => {
                tracing::debug!(
                    %job_id,
                    %state,
                    holder = holder.unwrap_or("-"),
                    "Skipping job that is not runnable here"
                );
            }
            RunnerEvent::JobStarted {
                job_id,
                resume_offset,
            } => {
                tracing::info!(%job_id, %resume_offset, "Processing job");
            }
            RunnerEvent::PageAppended {
                job_id,
                records,
                len,
            } => {
                tracing::debug!(%job_id, %records, %len, "Page appended");
            }
            RunnerEvent::FetchRetrying {
                job_id,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    %job_id,
                    %attempt,
                    delay_ms = %delay.as_millis(),
                    %error,
                    "Page fetch failed, retrying"
                );
            }
            RunnerEvent::JobCompleted { job_id, records } => {
                tracing::info!(%job_id, %records, "Job completed");
            }
            RunnerEvent::JobFailed { job_id, error } => {
                tracing::warn!(%job_id, %error, "Job failed");
            }
            RunnerEvent::JobCancelled { job_id, records } => {
                tracing::info!(%job_id, %records, "Job cancelled");
            }
            RunnerEvent::JobSuspended { job_id, records } => {
                tracing::info!(%job_id, %records, "Job suspended for shutdown");
            }
            RunnerEvent::JobAbandoned { job_id, reason } => {
                tracing::error!(%job_id, %reason, "Job abandoned");
            }
            RunnerEvent::JobRequeued {
                job_id,
                attempt,
                delay,
            } => {
                tracing::warn!(
                    %job_id,
                    %attempt,
                    delay_ms = %delay.as_millis(),
                    "Requeueing abandoned job"
                );
            }
            RunnerEvent::WorkerStopped { slot } => {
                tracing::debug!(%slot, "Worker stopped");
            }
        }
    }
}

/// How a single run of a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { records: u64 },
    Failed { error: String },
    Cancelled { records: u64 },
    /// Stopped for shutdown; the job stays RUNNING and resumes later.
    Suspended { records: u64 },
    /// The runner could not make progress against the stores or lost its
    /// lease. The job is left as it was; the scheduler requeues it.
    Abandoned { reason: String },
}

/// Cancellation signals observed by a run.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// Fired when this job's cancellation is requested.
    pub cancel: CancellationToken,
    /// Fired when the engine is shutting down.
    pub shutdown: CancellationToken,
}

enum Boundary {
    Continue,
    Cancel,
    Suspend,
    Lost(String),
}

enum Fetch {
    Page(SourcePage),
    Interrupted,
    Fatal(String),
}

/// Drives one job's extraction loop to completion, cancellation or failure.
///
/// The runner is the only writer of COMPLETED/FAILED/CANCELLED for the job it
/// executes and the only appender of its records. Its resume position is
/// always the result store's length for the job.
///
/// Every page boundary renews the job's execution lease under the runner's
/// `worker_id`; losing the lease abandons the run before anything else is
/// appended.
#[derive(Clone)]
pub struct JobRunner<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    jobs: S,
    results: R,
    client: C,
    retry: RetryConfig,
    worker_id: String,
    lease_ttl: Duration,
}

impl<S, R, C> JobRunner<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    pub fn new(jobs: S, results: R, client: C, retry: RetryConfig) -> Self {
        Self {
            jobs,
            results,
            client,
            retry,
            worker_id: format!("runner-{}", Uuid::new_v4()),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Run under `worker_id`'s lease, renewed for `ttl` at each boundary.
    pub fn with_lease(mut self, worker_id: impl Into<String>, ttl: Duration) -> Self {
        self.worker_id = worker_id.into();
        self.lease_ttl = ttl;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `job`, which must already be RUNNING (or CANCELLING) and leased
    /// to this runner's worker or to nobody.
    pub async fn run(
        &self,
        job: &Job,
        signals: &RunSignals,
        reporter: &dyn RunnerReporter,
    ) -> RunOutcome {
        let job_id = job.id;
        let mut offset = match self.results.count(job_id).await {
            Ok(len) => len,
            Err(e) => return self.abandon(job_id, &e.to_string(), reporter),
        };
        let mut token: Option<String> = None;

        reporter.report(RunnerEvent::JobStarted {
            job_id,
            resume_offset: offset,
        });

        loop {
            match self.boundary(job_id, signals).await {
                Boundary::Continue => {}
                Boundary::Cancel => return self.finalize_cancelled(job_id, offset, reporter).await,
                Boundary::Suspend => return self.suspend(job_id, offset, reporter).await,
                Boundary::Lost(reason) => return self.abandon(job_id, &reason, reporter),
            }

            let cursor = SourceCursor {
                offset,
                token: token.take(),
            };
            let page = match self
                .fetch_with_retry(job_id, &job.spec, &cursor, signals, reporter)
                .await
            {
                Fetch::Page(page) => page,
                Fetch::Interrupted => continue,
                Fetch::Fatal(error) => {
                    return self.finalize_failed(job_id, offset, error, reporter).await;
                }
            };

            // A page fetched while a cancel landed is dropped, not appended.
            match self.boundary(job_id, signals).await {
                Boundary::Continue => {}
                Boundary::Cancel => return self.finalize_cancelled(job_id, offset, reporter).await,
                Boundary::Suspend => return self.suspend(job_id, offset, reporter).await,
                Boundary::Lost(reason) => return self.abandon(job_id, &reason, reporter),
            }

            let SourcePage {
                records,
                continuation,
            } = page;
            let fetched = records.len();
            if fetched > 0 {
                match self.results.append(job_id, records).await {
                    Ok(outcome) => offset = outcome.len,
                    Err(e) => return self.abandon(job_id, &e.to_string(), reporter),
                }
            }
            reporter.report(RunnerEvent::PageAppended {
                job_id,
                records: fetched,
                len: offset,
            });

            match continuation {
                Continuation::Done => {
                    return self.finalize_completed(job_id, offset, reporter).await;
                }
                Continuation::More { token: next } => token = next,
            }
        }
    }

    /// Page-boundary check and lease renewal. The job store is the source of
    /// truth, so a cancel requested from another process is seen here as well.
    async fn boundary(&self, job_id: Uuid, signals: &RunSignals) -> Boundary {
        let job = match self
            .jobs
            .acquire_lease(job_id, &self.worker_id, self.lease_ttl)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return Boundary::Lost("execution lease lost".to_string()),
            Err(e) => return Boundary::Lost(e.to_string()),
        };
        match job.state {
            JobState::Cancelling => Boundary::Cancel,
            JobState::Running if signals.shutdown.is_cancelled() => Boundary::Suspend,
            JobState::Running => Boundary::Continue,
            other => Boundary::Lost(format!("job is {other}")),
        }
    }

    async fn fetch_with_retry(
        &self,
        job_id: Uuid,
        spec: &JobSpec,
        cursor: &SourceCursor,
        signals: &RunSignals,
        reporter: &dyn RunnerReporter,
    ) -> Fetch {
        let mut attempt = 0;
        loop {
            let error = match self.client.fetch_page(spec, cursor).await {
                Ok(page) => return Fetch::Page(page),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Fetch::Fatal(error.to_string());
            }
            if attempt >= self.retry.max_retries {
                return Fetch::Fatal(format!("{error} (gave up after {attempt} retries)"));
            }

            attempt += 1;
            let delay = self.retry.delay_for_attempt(attempt);
            let message = error.to_string();
            reporter.report(RunnerEvent::FetchRetrying {
                job_id,
                attempt,
                delay,
                error: &message,
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = signals.cancel.cancelled() => return Fetch::Interrupted,
                () = signals.shutdown.cancelled() => return Fetch::Interrupted,
            }
        }
    }

    async fn finalize_completed(
        &self,
        job_id: Uuid,
        records: u64,
        reporter: &dyn RunnerReporter,
    ) -> RunOutcome {
        let transition = Transition::to(JobState::Completed).with_record_count(records);
        match self
            .jobs
            .transition(job_id, JobState::Running, transition)
            .await
        {
            Ok(_) => {
                reporter.report(RunnerEvent::JobCompleted { job_id, records });
                RunOutcome::Completed { records }
            }
            // Cancellation won the race against completion.
            Err(AppError::InvalidTransition {
                from: JobState::Cancelling,
                ..
            }) => self.finalize_cancelled(job_id, records, reporter).await,
            Err(e) => self.abandon(job_id, &e.to_string(), reporter),
        }
    }

    async fn finalize_failed(
        &self,
        job_id: Uuid,
        records: u64,
        error: String,
        reporter: &dyn RunnerReporter,
    ) -> RunOutcome {
        let transition = Transition::to(JobState::Failed)
            .with_error(error.clone())
            .with_record_count(records);
        match self
            .jobs
            .transition(job_id, JobState::Running, transition)
            .await
        {
            Ok(_) => {
                reporter.report(RunnerEvent::JobFailed {
                    job_id,
                    error: &error,
                });
                RunOutcome::Failed { error }
            }
            Err(AppError::InvalidTransition {
                from: JobState::Cancelling,
                ..
            }) => self.finalize_cancelled(job_id, records, reporter).await,
            Err(e) => self.abandon(job_id, &e.to_string(), reporter),
        }
    }

    async fn finalize_cancelled(
        &self,
        job_id: Uuid,
        records: u64,
        reporter: &dyn RunnerReporter,
    ) -> RunOutcome {
        let transition = Transition::to(JobState::Cancelled).with_record_count(records);
        match self
            .jobs
            .transition(job_id, JobState::Cancelling, transition)
            .await
        {
            Ok(_) => {
                reporter.report(RunnerEvent::JobCancelled { job_id, records });
                RunOutcome::Cancelled { records }
            }
            Err(e) => self.abandon(job_id, &e.to_string(), reporter),
        }
    }

    /// Leave the job RUNNING and hand the lease back so the next process can
    /// resume it at once.
    async fn suspend(
        &self,
        job_id: Uuid,
        records: u64,
        reporter: &dyn RunnerReporter,
    ) -> RunOutcome {
        if let Err(e) = self.jobs.release_lease(job_id, &self.worker_id).await {
            tracing::warn!(%job_id, error = %e, "Failed to release lease on suspend");
        }
        reporter.report(RunnerEvent::JobSuspended { job_id, records });
        RunOutcome::Suspended { records }
    }

    fn abandon(&self, job_id: Uuid, reason: &str, reporter: &dyn RunnerReporter) -> RunOutcome {
        reporter.report(RunnerEvent::JobAbandoned { job_id, reason });
        RunOutcome::Abandoned {
            reason: reason.to_string(),
        }
    }
}
