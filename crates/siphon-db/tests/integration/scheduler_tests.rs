use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use siphon_core::{
    AppError, EngineConfig, ExtractionClient, JobSpec, JobState, JobStore, PageRequest,
    ResultStore, RetryConfig, Scheduler, SourceCursor, SourcePage, TracingRunnerReporter,
};
use siphon_db::{PgJobStore, PgResultStore};
use uuid::Uuid;

use crate::integration::common::{records, setup_test_db};

/// Serves `params.total` records in pages of `params.page`, seeking by offset.
#[derive(Clone)]
struct CountingClient {
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CountingClient {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Most fetches ever in flight at once.
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ExtractionClient for CountingClient {
    async fn fetch_page(
        &self,
        spec: &JobSpec,
        cursor: &SourceCursor,
    ) -> Result<SourcePage, AppError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if spec.params["fail"].as_bool().unwrap_or(false) {
            return Err(AppError::fatal("Invalid API token"));
        }
        let total = spec.params["total"].as_u64().unwrap_or(0);
        let page = spec.params["page"].as_u64().unwrap_or(10);
        let start = cursor.offset.min(total);
        let end = (start + page).min(total);
        let batch = records(start, end - start);
        if end >= total {
            Ok(SourcePage::last(batch))
        } else {
            Ok(SourcePage::more(batch, None))
        }
    }
}

fn spec(total: u64, page: u64) -> JobSpec {
    JobSpec::new(
        "counting",
        serde_json::json!({"total": total, "page": page, "nonce": Uuid::new_v4()}),
    )
}

fn start(
    pool: &sqlx::PgPool,
    latency: Duration,
) -> Scheduler<PgJobStore, PgResultStore, CountingClient> {
    start_with(pool, CountingClient::new(latency))
}

fn start_with(
    pool: &sqlx::PgPool,
    client: CountingClient,
) -> Scheduler<PgJobStore, PgResultStore, CountingClient> {
    let config = EngineConfig::default()
        .with_workers(2)
        .with_retry(RetryConfig::none());
    Scheduler::start(
        PgJobStore::new(pool.clone()),
        PgResultStore::new(pool.clone()),
        client,
        config,
        Arc::new(TracingRunnerReporter),
    )
}

async fn wait_for_state(store: &PgJobStore, job_id: Uuid, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = store.get(job_id).await.unwrap().state;
        if current == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {current}, expected {state}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn jobs_complete_against_postgres() {
    let (pool, _container) = setup_test_db().await;
    let scheduler = start(&pool, Duration::ZERO);
    let store = PgJobStore::new(pool.clone());

    let a = scheduler.submit(spec(25, 10)).await.unwrap();
    let b = scheduler.submit(spec(0, 10)).await.unwrap();
    wait_for_state(&store, a, JobState::Completed).await;
    wait_for_state(&store, b, JobState::Completed).await;

    let job = scheduler.status(a).await.unwrap();
    assert_eq!(job.record_count, 25);
    let page = scheduler.results(a, PageRequest::first(100)).await.unwrap();
    let offsets: Vec<u64> = page.items.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..25).collect::<Vec<_>>());

    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.total_records, 25);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn fatal_source_error_fails_job() {
    let (pool, _container) = setup_test_db().await;
    let scheduler = start(&pool, Duration::ZERO);
    let store = PgJobStore::new(pool.clone());

    let id = scheduler
        .submit(JobSpec::new("counting", serde_json::json!({"fail": true})))
        .await
        .unwrap();
    wait_for_state(&store, id, JobState::Failed).await;

    let job = scheduler.status(id).await.unwrap();
    assert_eq!(job.error.as_deref(), Some("Source error: Invalid API token"));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancel_running_job_keeps_partial_results() {
    let (pool, _container) = setup_test_db().await;
    let scheduler = start(&pool, Duration::from_millis(50));
    let store = PgJobStore::new(pool.clone());

    let id = scheduler.submit(spec(1_000, 5)).await.unwrap();
    wait_for_state(&store, id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    scheduler.cancel(id).await.unwrap();
    wait_for_state(&store, id, JobState::Cancelled).await;

    let job = scheduler.status(id).await.unwrap();
    let stored = PgResultStore::new(pool.clone()).count(id).await.unwrap();
    assert_eq!(job.record_count, stored);
    assert!(stored < 1_000);
    assert_eq!(stored % 5, 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_running_job_from_stored_count() {
    let (pool, _container) = setup_test_db().await;
    let store = PgJobStore::new(pool.clone());

    let first = start(&pool, Duration::from_millis(30));
    let id = first.submit(spec(60, 5)).await.unwrap();
    wait_for_state(&store, id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.shutdown().await;

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    let before = PgResultStore::new(pool.clone()).count(id).await.unwrap();
    assert!(before < 60);

    let second = start(&pool, Duration::ZERO);
    assert_eq!(second.recover().await.unwrap(), 1);
    wait_for_state(&store, id, JobState::Completed).await;

    let page = second.results(id, PageRequest::first(100)).await.unwrap();
    let ids: Vec<&str> = page.items.iter().map(|r| r.external_id.as_str()).collect();
    let expected: Vec<String> = (0..60).map(|i| format!("record_{i}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    second.shutdown().await;
}

#[tokio::test]
async fn two_schedulers_on_one_pool_run_each_job_once() {
    let (pool, _container) = setup_test_db().await;
    let store = PgJobStore::new(pool.clone());
    let client = CountingClient::new(Duration::from_millis(20));

    let a = start_with(&pool, client.clone());
    let b = start_with(&pool, client.clone());

    let id = a.submit(spec(20, 1)).await.unwrap();
    wait_for_state(&store, id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    // B sees a RUNNING job it does not run and queues it, but the lease
    // held by A keeps it from executing.
    assert_eq!(b.recover().await.unwrap(), 1);
    wait_for_state(&store, id, JobState::Completed).await;

    assert_eq!(client.peak(), 1);
    let page = a.results(id, PageRequest::first(100)).await.unwrap();
    let ids: Vec<&str> = page.items.iter().map(|r| r.external_id.as_str()).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("record_{i}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());

    let job = store.get(id).await.unwrap();
    assert_eq!(job.record_count, 20);
    assert!(job.worker_id.is_none());

    a.shutdown().await;
    b.shutdown().await;
}
