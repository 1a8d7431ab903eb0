//! Test utilities: mock extraction client, failing result store and
//! recording reporter.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobSpec, JobState};
use crate::job_store::JobStore;
use crate::memory::InMemoryResultStore;
use crate::models::{AppendOutcome, ExtractedRecord, SourceCursor, SourcePage, SourceRecord};
use crate::pagination::{Page, PageRequest};
use crate::result_store::ResultStore;
use crate::runner::{RunnerEvent, RunnerReporter};
use crate::traits::ExtractionClient;

// ---------------------------------------------------------------------------
// MockExtractionClient
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    /// `total` records served `per_page` at a time, seeking by offset.
    Paged { total: u64, per_page: u64 },
    /// Pops one scripted response per call; an empty script ends the job.
    Scripted(Arc<Mutex<VecDeque<Result<SourcePage, AppError>>>>),
    AlwaysFailing(ErrorFactory),
}

/// Mock client that records every cursor it is asked for.
#[derive(Clone)]
pub struct MockExtractionClient {
    behavior: Behavior,
    latency: Duration,
    calls: Arc<Mutex<Vec<SourceCursor>>>,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    peak_per_spec: Arc<Mutex<usize>>,
}

impl MockExtractionClient {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            peak_per_spec: Arc::new(Mutex::new(0)),
        }
    }

    /// `pages` full pages of `per_page` records named `record_{i}`.
    pub fn paged(pages: u64, per_page: u64) -> Self {
        Self::with_behavior(Behavior::Paged {
            total: pages * per_page,
            per_page,
        })
    }

    pub fn scripted(responses: Vec<Result<SourcePage, AppError>>) -> Self {
        Self::with_behavior(Behavior::Scripted(Arc::new(Mutex::new(
            responses.into(),
        ))))
    }

    pub fn always_failing(error: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        Self::with_behavior(Behavior::AlwaysFailing(Arc::new(error)))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<SourceCursor> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of concurrent fetches observed for any single spec.
    pub fn peak_concurrency_per_spec(&self) -> usize {
        *self.peak_per_spec.lock().unwrap()
    }

    fn enter(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(key.to_string()).or_insert(0);
        *count += 1;
        let mut peak = self.peak_per_spec.lock().unwrap();
        *peak = (*peak).max(*count);
    }

    fn leave(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(key) {
            *count -= 1;
        }
    }

    fn respond(&self, cursor: &SourceCursor) -> Result<SourcePage, AppError> {
        match &self.behavior {
            Behavior::Paged { total, per_page } => {
                let start = cursor.offset.min(*total);
                let end = (start + per_page).min(*total);
                Ok(make_page(start, end - start, end == *total))
            }
            Behavior::Scripted(responses) => responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SourcePage::last(Vec::new()))),
            Behavior::AlwaysFailing(error) => Err(error()),
        }
    }
}

impl ExtractionClient for MockExtractionClient {
    async fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> Result<SourcePage, AppError> {
        self.calls.lock().unwrap().push(cursor.clone());
        let key = spec.fingerprint();
        self.enter(&key);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let response = self.respond(cursor);
        self.leave(&key);
        response
    }
}

// ---------------------------------------------------------------------------
// FlakyResultStore
// ---------------------------------------------------------------------------

/// In-memory result store whose first `failures` appends fail with a
/// database error and write nothing.
#[derive(Clone)]
pub struct FlakyResultStore {
    inner: InMemoryResultStore,
    failures_left: Arc<Mutex<u32>>,
}

impl FlakyResultStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryResultStore::new(),
            failures_left: Arc::new(Mutex::new(failures)),
        }
    }
}

impl ResultStore for FlakyResultStore {
    async fn append(
        &self,
        job_id: Uuid,
        records: Vec<SourceRecord>,
    ) -> Result<AppendOutcome, AppError> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(AppError::DatabaseError("connection reset".into()));
            }
        }
        self.inner.append(job_id, records).await
    }

    async fn page(
        &self,
        job_id: Uuid,
        request: PageRequest,
    ) -> Result<Page<ExtractedRecord>, AppError> {
        self.inner.page(job_id, request).await
    }

    async fn count(&self, job_id: Uuid) -> Result<u64, AppError> {
        self.inner.count(job_id).await
    }

    async fn remove(&self, job_id: Uuid) -> Result<u64, AppError> {
        self.inner.remove(job_id).await
    }

    async fn total_count(&self) -> Result<u64, AppError> {
        self.inner.total_count().await
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records event labels in arrival order.
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == label)
            .count()
    }
}

impl RunnerReporter for RecordingReporter {
    fn report(&self, event: RunnerEvent<'_>) {
        let label = match &event {
            RunnerEvent::WorkerStarted { .. } => "WorkerStarted",
            RunnerEvent::JobQueued { .. } => "JobQueued",
            RunnerEvent::JobAssigned { .. } => "JobAssigned",
            RunnerEvent::JobSkipped { .. } => "JobSkipped",
            RunnerEvent::JobStarted { .. } => "JobStarted",
            RunnerEvent::PageAppended { .. } => "PageAppended",
            RunnerEvent::FetchRetrying { .. } => "FetchRetrying",
            RunnerEvent::JobCompleted { .. } => "JobCompleted",
            RunnerEvent::JobFailed { .. } => "JobFailed",
            RunnerEvent::JobCancelled { .. } => "JobCancelled",
            RunnerEvent::JobSuspended { .. } => "JobSuspended",
            RunnerEvent::JobAbandoned { .. } => "JobAbandoned",
            RunnerEvent::JobRequeued { .. } => "JobRequeued",
            RunnerEvent::WorkerStopped { .. } => "WorkerStopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Records `record_{start}..record_{start + count}`.
pub fn make_page(start: u64, count: u64, last: bool) -> SourcePage {
    let records = (start..start + count)
        .map(|i| SourceRecord::new(format!("record_{i}"), serde_json::json!({ "n": i })))
        .collect();
    if last {
        SourcePage::last(records)
    } else {
        SourcePage::more(records, Some(format!("t{}", start + count)))
    }
}

/// A spec for the mock source, distinguished by `label`.
pub fn mock_spec(label: &str) -> JobSpec {
    JobSpec::new("mock", serde_json::json!({ "label": label }))
}

/// Poll the store until the job reaches `state`, panicking after `timeout`.
pub async fn wait_for_state<S: JobStore>(
    store: &S,
    job_id: Uuid,
    state: JobState,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = store.get(job_id).await.unwrap().state;
        if current == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {current}, expected {state}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A PENDING job for the mock source that is not in any store.
pub fn make_test_job() -> Job {
    Job::new(mock_spec("test"))
}
