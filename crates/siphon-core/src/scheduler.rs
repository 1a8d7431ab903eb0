//! Admission control and the worker pool.
//!
//! All dispatch decisions (queueing, slot binding, cancellation) are
//! serialized through one `tokio::sync::Mutex<Dispatch>`. A job id is bound
//! to at most one slot at a time and is never both queued and bound.
//!
//! Across schedulers sharing a store, a job runs only under its execution
//! lease; see [`JobStore::acquire_lease`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::AppError;
use crate::job::{Job, JobSpec, JobState};
use crate::job_store::{JobStore, request_cancel};
use crate::models::ExtractedRecord;
use crate::pagination::{Page, PageRequest};
use crate::result_store::ResultStore;
use crate::runner::{JobRunner, RunOutcome, RunSignals, RunnerEvent, RunnerReporter};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::traits::ExtractionClient;

#[derive(Debug)]
struct Dispatch {
    queue: VecDeque<Uuid>,
    queued: HashSet<Uuid>,
    /// Job bound to each WorkerSlot.
    slots: Vec<Option<Uuid>>,
    /// Cancellation token of every bound job.
    tokens: HashMap<Uuid, CancellationToken>,
    /// Consecutive abandoned runs per job, for requeue backoff.
    abandoned: HashMap<Uuid, u32>,
}

impl Dispatch {
    fn new(workers: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            slots: vec![None; workers],
            tokens: HashMap::new(),
            abandoned: HashMap::new(),
        }
    }

    fn is_tracked(&self, job_id: Uuid) -> bool {
        self.queued.contains(&job_id) || self.tokens.contains_key(&job_id)
    }

    fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn push(&mut self, job_id: Uuid, capacity: Option<usize>) -> Result<usize, AppError> {
        if let Some(capacity) = capacity
            && self.queue.len() >= capacity
        {
            return Err(AppError::Overloaded { capacity });
        }
        self.queue.push_back(job_id);
        self.queued.insert(job_id);
        Ok(self.queue.len())
    }

    fn unqueue(&mut self, job_id: Uuid) -> bool {
        if self.queued.remove(&job_id) {
            self.queue.retain(|id| *id != job_id);
            true
        } else {
            false
        }
    }
}

/// Result of [`Scheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: Uuid,
    /// False when the job was already queued, bound to a slot, or terminal.
    pub queued: bool,
}

/// Liveness of the scheduler and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    /// The dispatch lock was acquired within `health_timeout`.
    pub responsive: bool,
    pub shutting_down: bool,
    pub workers: usize,
    pub live_workers: usize,
    /// Only known when responsive.
    pub busy: Option<usize>,
    pub queued: Option<usize>,
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        self.responsive && !self.shutting_down && self.live_workers == self.workers
    }
}

struct Shared<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    jobs: S,
    results: R,
    runner: JobRunner<S, R, C>,
    stats: StatsAggregator<S, R>,
    config: EngineConfig,
    dispatch: Mutex<Dispatch>,
    notify: Notify,
    shutdown: CancellationToken,
    live_workers: AtomicUsize,
    reporter: Arc<dyn RunnerReporter>,
}

/// Owns the worker pool and serves the engine's external operations.
pub struct Scheduler<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    shared: Arc<Shared<S, R, C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, R, C> Scheduler<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    /// Spawn `config.workers` worker tasks on the current runtime.
    pub fn start(
        jobs: S,
        results: R,
        client: C,
        config: EngineConfig,
        reporter: Arc<dyn RunnerReporter>,
    ) -> Self {
        let workers = config.workers.max(1);
        let worker_id = format!("scheduler-{}", Uuid::new_v4());
        let runner = JobRunner::new(jobs.clone(), results.clone(), client, config.retry.clone())
            .with_lease(worker_id.clone(), config.lease_ttl);
        let shared = Arc::new(Shared {
            runner,
            stats: StatsAggregator::new(jobs.clone(), results.clone()),
            jobs,
            results,
            dispatch: Mutex::new(Dispatch::new(workers)),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            live_workers: AtomicUsize::new(0),
            reporter,
            config,
        });

        let handles = (0..workers)
            .map(|slot| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { shared.work(slot).await })
            })
            .collect();

        tracing::info!(%workers, %worker_id, "Scheduler started");
        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Create a PENDING job and queue it.
    ///
    /// Fails with `Overloaded` before creating anything when the queue is at
    /// capacity.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid, AppError> {
        let mut dispatch = self.shared.dispatch.lock().await;
        if let Some(capacity) = self.shared.config.queue_capacity
            && dispatch.queue.len() >= capacity
        {
            return Err(AppError::Overloaded { capacity });
        }

        let job = self.shared.jobs.create(spec).await?;
        let depth = dispatch.push(job.id, self.shared.config.queue_capacity)?;
        drop(dispatch);

        self.shared.reporter.report(RunnerEvent::JobQueued {
            job_id: job.id,
            depth,
        });
        self.shared.notify.notify_one();
        Ok(job.id)
    }

    /// Request execution of an existing job.
    ///
    /// Does nothing, reporting `queued: false`, if the job is already queued,
    /// bound to a slot, or terminal. Either way the job's id is returned.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<Enqueued, AppError> {
        self.shared.enqueue(job_id).await
    }

    /// Request cancellation. Idempotent; terminal jobs are returned as-is.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, AppError> {
        let mut dispatch = self.shared.dispatch.lock().await;
        let job = request_cancel(&self.shared.jobs, job_id).await?;

        if job.state == JobState::Cancelled {
            dispatch.unqueue(job_id);
        }
        if let Some(token) = dispatch.tokens.get(&job_id) {
            token.cancel();
        }
        Ok(job)
    }

    /// Current job record. While the job runs, `record_count` reflects the
    /// records appended so far.
    pub async fn status(&self, job_id: Uuid) -> Result<Job, AppError> {
        let mut job = self.shared.jobs.get(job_id).await?;
        if matches!(job.state, JobState::Running | JobState::Cancelling) {
            job.record_count = self.shared.results.count(job_id).await?;
        }
        Ok(job)
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        page: PageRequest,
    ) -> Result<Page<Job>, AppError> {
        self.shared.jobs.list(state, page).await
    }

    /// A page of the job's records. Fails with `NotFound` for unknown jobs.
    pub async fn results(
        &self,
        job_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<ExtractedRecord>, AppError> {
        self.shared.jobs.get(job_id).await?;
        let page = PageRequest {
            limit: page.clamped_limit(self.shared.config.max_page_size),
            ..page
        };
        self.shared.results.page(job_id, page).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, AppError> {
        self.shared.stats.snapshot().await
    }

    /// Delete a terminal job and its records. Returns the number of records
    /// removed.
    pub async fn remove(&self, job_id: Uuid) -> Result<u64, AppError> {
        let job = self.shared.jobs.get(job_id).await?;
        if !job.state.is_terminal() {
            return Err(AppError::JobActive {
                job_id,
                state: job.state,
            });
        }
        let removed = self.shared.results.remove(job_id).await?;
        self.shared.jobs.delete(job_id).await?;
        tracing::info!(%job_id, %removed, "Job removed");
        Ok(removed)
    }

    pub async fn health(&self) -> PoolHealth {
        let shared = &self.shared;
        let live_workers = shared.live_workers.load(Ordering::SeqCst);
        let shutting_down = shared.shutdown.is_cancelled();

        match tokio::time::timeout(shared.config.health_timeout, shared.dispatch.lock()).await {
            Ok(dispatch) => PoolHealth {
                responsive: true,
                shutting_down,
                workers: dispatch.slots.len(),
                live_workers,
                busy: Some(dispatch.busy()),
                queued: Some(dispatch.queue.len()),
            },
            Err(_) => PoolHealth {
                responsive: false,
                shutting_down,
                workers: shared.config.workers.max(1),
                live_workers,
                busy: None,
                queued: None,
            },
        }
    }

    /// Queue every non-terminal job in the store that is not already queued
    /// or running here. RUNNING and CANCELLING orphans come first and resume
    /// from their stored record count. Jobs whose lease another live
    /// scheduler holds are queued too but skipped at claim time.
    ///
    /// Safe to call repeatedly. Returns how many jobs were queued.
    pub async fn recover(&self) -> Result<usize, AppError> {
        let mut queued = 0;
        for state in [JobState::Cancelling, JobState::Running, JobState::Pending] {
            for job_id in self.ids_in_state(state).await? {
                match self.enqueue(job_id).await {
                    Ok(Enqueued { queued: true, .. }) => queued += 1,
                    Ok(_) | Err(AppError::NotFound(_)) => {}
                    Err(AppError::Overloaded { capacity }) => {
                        tracing::warn!(%capacity, %queued, "Queue full, deferring recovery");
                        return Ok(queued);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if queued > 0 {
            tracing::info!(%queued, "Recovered jobs");
        }
        Ok(queued)
    }

    async fn ids_in_state(&self, state: JobState) -> Result<Vec<Uuid>, AppError> {
        let limit = self.shared.config.max_page_size;
        let mut request = PageRequest::first(limit);
        let mut ids = Vec::new();
        loop {
            let page = self.shared.jobs.list(Some(state), request).await?;
            ids.extend(page.items.iter().map(|j| j.id));
            match page.next_cursor {
                Some(cursor) => request = PageRequest::after(cursor, limit),
                None => return Ok(ids),
            }
        }
    }

    /// Stop all workers and wait for them. Running jobs stop at their next
    /// page boundary and stay RUNNING.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

struct LiveWorker<'a>(&'a AtomicUsize);

impl<'a> LiveWorker<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S, R, C> Shared<S, R, C>
where
    S: JobStore,
    R: ResultStore,
    C: ExtractionClient,
{
    async fn work(self: Arc<Self>, slot: usize) {
        let _live = LiveWorker::enter(&self.live_workers);
        self.reporter.report(RunnerEvent::WorkerStarted { slot });

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.claim(slot).await {
                Some((job, cancel)) => {
                    let signals = RunSignals {
                        cancel,
                        shutdown: self.shutdown.clone(),
                    };
                    let outcome = self.runner.run(&job, &signals, self.reporter.as_ref()).await;
                    if let Some(attempt) = self.release(slot, job.id, &outcome).await {
                        self.requeue_later(job.id, attempt);
                    }
                }
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.reporter.report(RunnerEvent::WorkerStopped { slot });
    }

    /// Pop the next runnable job and bind it to `slot`.
    ///
    /// The job's execution lease is taken here, under the dispatch lock:
    /// PENDING jobs move to RUNNING, while RUNNING and CANCELLING jobs are
    /// resumed only if no other live worker holds them.
    async fn claim(&self, slot: usize) -> Option<(Job, CancellationToken)> {
        let mut dispatch = self.dispatch.lock().await;

        while let Some(job_id) = dispatch.queue.pop_front() {
            dispatch.queued.remove(&job_id);

            let job = match self
                .jobs
                .acquire_lease(job_id, self.runner.worker_id(), self.config.lease_ttl)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if let Ok(current) = self.jobs.get(job_id).await {
                        self.reporter.report(RunnerEvent::JobSkipped {
                            job_id,
                            state: current.state,
                            holder: current.worker_id.as_deref(),
                        });
                    }
                    continue;
                }
                Err(AppError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "Failed to lease queued job, left for recovery");
                    continue;
                }
            };

            let token = CancellationToken::new();
            if job.state == JobState::Cancelling {
                token.cancel();
            }
            dispatch.slots[slot] = Some(job_id);
            dispatch.tokens.insert(job_id, token.clone());

            if !dispatch.queue.is_empty() {
                self.notify.notify_one();
            }
            drop(dispatch);

            self.reporter.report(RunnerEvent::JobAssigned { job_id, slot });
            return Some((job, token));
        }

        None
    }

    /// Unbind `slot`. Returns the job's consecutive abandonment count when
    /// the run was abandoned.
    async fn release(&self, slot: usize, job_id: Uuid, outcome: &RunOutcome) -> Option<u32> {
        let mut dispatch = self.dispatch.lock().await;
        dispatch.slots[slot] = None;
        dispatch.tokens.remove(&job_id);

        if matches!(outcome, RunOutcome::Abandoned { .. }) {
            let attempt = dispatch.abandoned.entry(job_id).or_insert(0);
            *attempt = attempt.saturating_add(1);
            Some(*attempt)
        } else {
            dispatch.abandoned.remove(&job_id);
            None
        }
    }

    async fn enqueue(&self, job_id: Uuid) -> Result<Enqueued, AppError> {
        let job = self.jobs.get(job_id).await?;
        if job.state.is_terminal() {
            return Ok(Enqueued {
                job_id,
                queued: false,
            });
        }

        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_tracked(job_id) {
            return Ok(Enqueued {
                job_id,
                queued: false,
            });
        }
        let depth = dispatch.push(job_id, self.config.queue_capacity)?;
        drop(dispatch);

        self.reporter.report(RunnerEvent::JobQueued { job_id, depth });
        self.notify.notify_one();
        Ok(Enqueued {
            job_id,
            queued: true,
        })
    }

    /// Put an abandoned job back in the queue after the retry backoff for
    /// `attempt`. Shutdown drops the pending requeue; `recover()` picks the
    /// job up in the next process.
    fn requeue_later(self: &Arc<Self>, job_id: Uuid, attempt: u32) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let delay = self.config.retry.delay_for_attempt(attempt);
        self.reporter.report(RunnerEvent::JobRequeued {
            job_id,
            attempt,
            delay,
        });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shared.shutdown.cancelled() => return,
            }
            match shared.enqueue(job_id).await {
                Ok(Enqueued { queued: true, .. }) => {}
                Ok(_) | Err(AppError::NotFound(_)) => {
                    shared.dispatch.lock().await.abandoned.remove(&job_id);
                }
                Err(e) => {
                    tracing::warn!(%job_id, error = %e, "Failed to requeue abandoned job");
                }
            }
        });
    }
}
