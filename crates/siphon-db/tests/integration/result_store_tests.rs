use siphon_core::{AppError, JobStore, PageRequest, ResultStore};
use siphon_db::{PgJobStore, PgResultStore};

use crate::integration::common::{records, setup_test_db, test_spec};

#[tokio::test]
async fn append_assigns_gap_free_offsets() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let job = jobs.create(test_spec("append")).await.unwrap();

    let first = results.append(job.id, records(0, 3)).await.unwrap();
    assert_eq!(first.first_offset, 0);
    assert_eq!(first.len, 3);

    let second = results.append(job.id, records(3, 2)).await.unwrap();
    assert_eq!(second.first_offset, 3);
    assert_eq!(second.len, 5);

    let page = results.page(job.id, PageRequest::first(10)).await.unwrap();
    let offsets: Vec<u64> = page.items.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    assert_eq!(page.items[4].external_id, "record_4");
    assert_eq!(page.items[4].data["n"], 4);
    assert_eq!(results.count(job.id).await.unwrap(), 5);
}

#[tokio::test]
async fn empty_append_is_a_no_op() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let job = jobs.create(test_spec("empty")).await.unwrap();

    results.append(job.id, records(0, 2)).await.unwrap();
    let outcome = results.append(job.id, Vec::new()).await.unwrap();
    assert_eq!(outcome.first_offset, 2);
    assert_eq!(outcome.len, 2);
}

#[tokio::test]
async fn append_to_unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let results = PgResultStore::new(pool);

    let err = results
        .append(uuid::Uuid::new_v4(), records(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn pages_walk_the_sequence_and_resume_cursor_tails_it() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let job = jobs.create(test_spec("pages")).await.unwrap();
    results.append(job.id, records(0, 5)).await.unwrap();

    let first = results.page(job.id, PageRequest::first(2)).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let second = results
        .page(job.id, PageRequest::after(first.next_cursor.unwrap(), 2))
        .await
        .unwrap();
    assert_eq!(second.items[0].offset, 2);
    let third = results
        .page(job.id, PageRequest::after(second.next_cursor.unwrap(), 2))
        .await
        .unwrap();
    assert_eq!(third.items.len(), 1);
    assert!(third.next_cursor.is_none());

    // Records appended later are reachable from the resume cursor.
    results.append(job.id, records(5, 2)).await.unwrap();
    let tail = results
        .page(job.id, PageRequest::after(third.resume_cursor, 10))
        .await
        .unwrap();
    let offsets: Vec<u64> = tail.items.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![5, 6]);
}

#[tokio::test]
async fn page_clamps_to_max_size() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool).with_max_page_size(4);
    let job = jobs.create(test_spec("clamp")).await.unwrap();
    results.append(job.id, records(0, 10)).await.unwrap();

    let page = results.page(job.id, PageRequest::first(500)).await.unwrap();
    assert_eq!(page.items.len(), 4);
    assert!(page.next_cursor.is_some());
}

#[tokio::test]
async fn sequences_are_isolated_per_job() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let a = jobs.create(test_spec("a")).await.unwrap();
    let b = jobs.create(test_spec("b")).await.unwrap();

    results.append(a.id, records(0, 3)).await.unwrap();
    let outcome = results.append(b.id, records(100, 2)).await.unwrap();
    assert_eq!(outcome.first_offset, 0);

    assert_eq!(results.count(a.id).await.unwrap(), 3);
    assert_eq!(results.count(b.id).await.unwrap(), 2);
    assert_eq!(results.total_count().await.unwrap(), 5);

    assert_eq!(results.remove(a.id).await.unwrap(), 3);
    assert_eq!(results.count(a.id).await.unwrap(), 0);
    assert_eq!(results.total_count().await.unwrap(), 2);
    assert_eq!(results.remove(a.id).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_appends_stay_gap_free() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let job = jobs.create(test_spec("concurrent")).await.unwrap();

    let mut handles = Vec::new();
    for batch in 0..4u64 {
        let results = results.clone();
        handles.push(tokio::spawn(async move {
            results.append(job.id, records(batch * 10, 5)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let page = results.page(job.id, PageRequest::first(100)).await.unwrap();
    let offsets: Vec<u64> = page.items.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn deleting_job_cascades_to_records() {
    let (pool, _container) = setup_test_db().await;
    let jobs = PgJobStore::new(pool.clone());
    let results = PgResultStore::new(pool);
    let job = jobs.create(test_spec("cascade")).await.unwrap();
    results.append(job.id, records(0, 4)).await.unwrap();

    siphon_core::request_cancel(&jobs, job.id).await.unwrap();
    jobs.delete(job.id).await.unwrap();

    assert_eq!(results.count(job.id).await.unwrap(), 0);
}
