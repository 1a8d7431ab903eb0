//! In-process implementations of [`JobStore`] and [`ResultStore`].
//!
//! Everything lives behind `Arc<RwLock<_>>`, so clones share state. Suitable
//! for a single engine process and for tests; the Postgres stores in
//! `siphon-db` are the durable counterparts.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobSpec, JobState, Transition};
use crate::job_store::{CompletedTimings, JobStore, lease_delta, validate_edge};
use crate::models::{AppendOutcome, ExtractedRecord, SourceRecord};
use crate::pagination::{DEFAULT_MAX_PAGE_SIZE, Page, PageRequest, paginate};
use crate::result_store::ResultStore;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned store lock");
        PoisonError::into_inner(poisoned)
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned store lock");
        PoisonError::into_inner(poisoned)
    })
}

#[derive(Debug, Default)]
struct JobTable {
    /// Creation order.
    order: Vec<Uuid>,
    by_id: HashMap<Uuid, Job>,
}

/// Job store held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    table: Arc<RwLock<JobTable>>,
    unique_specs: bool,
    max_page_size: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(JobTable::default())),
            unique_specs: false,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Reject `create` while a non-terminal job with the same spec exists.
    pub fn with_unique_specs(mut self) -> Self {
        self.unique_specs = true;
        self
    }

    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }

    /// Insert a job as-is, bypassing the lifecycle. For seeding and tests.
    pub fn insert(&self, job: Job) {
        let mut table = write(&self.table);
        if table.by_id.insert(job.id, job.clone()).is_none() {
            table.order.push(job.id);
        }
    }
}

impl JobStore for InMemoryJobStore {
    async fn create(&self, spec: JobSpec) -> Result<Job, AppError> {
        let mut table = write(&self.table);

        if self.unique_specs {
            let fingerprint = spec.fingerprint();
            if let Some(existing) = table
                .by_id
                .values()
                .find(|j| !j.state.is_terminal() && j.spec.fingerprint() == fingerprint)
            {
                return Err(AppError::DuplicateSpec {
                    existing: existing.id,
                });
            }
        }

        let job = Job::new(spec);
        table.order.push(job.id);
        table.by_id.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, AppError> {
        read(&self.table)
            .by_id
            .get(&job_id)
            .cloned()
            .ok_or(AppError::NotFound(job_id))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobState,
        transition: Transition,
    ) -> Result<Job, AppError> {
        validate_edge(job_id, from, transition.to)?;

        let mut table = write(&self.table);
        let job = table
            .by_id
            .get_mut(&job_id)
            .ok_or(AppError::NotFound(job_id))?;

        if job.state != from {
            return Err(AppError::InvalidTransition {
                job_id,
                from: job.state,
                to: transition.to,
            });
        }

        job.apply(&transition, Utc::now());
        Ok(job.clone())
    }

    async fn acquire_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<Job>, AppError> {
        let mut table = write(&self.table);
        let job = table
            .by_id
            .get_mut(&job_id)
            .ok_or(AppError::NotFound(job_id))?;

        let now = Utc::now();
        if !job.lease_available_to(worker_id, now) {
            return Ok(None);
        }
        job.take_lease(worker_id, lease_delta(ttl), now);
        Ok(Some(job.clone()))
    }

    async fn release_lease(&self, job_id: Uuid, worker_id: &str) -> Result<(), AppError> {
        let mut table = write(&self.table);
        let job = table
            .by_id
            .get_mut(&job_id)
            .ok_or(AppError::NotFound(job_id))?;
        if job.worker_id.as_deref() == Some(worker_id) {
            job.clear_lease();
        }
        Ok(())
    }

    async fn list(&self, state: Option<JobState>, page: PageRequest) -> Result<Page<Job>, AppError> {
        let table = read(&self.table);
        let matching: Vec<&Job> = table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .filter(|j| state.is_none_or(|s| j.state == s))
            .collect();
        Ok(paginate(&matching, &page, self.max_page_size).map(Job::clone))
    }

    async fn delete(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut table = write(&self.table);
        let state = table
            .by_id
            .get(&job_id)
            .map(|j| j.state)
            .ok_or(AppError::NotFound(job_id))?;
        if !state.is_terminal() {
            return Err(AppError::JobActive { job_id, state });
        }
        table.by_id.remove(&job_id);
        table.order.retain(|id| *id != job_id);
        Ok(())
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let table = read(&self.table);
        Ok(table.by_id.values().filter(|j| j.state == state).count() as u64)
    }

    async fn completed_timings(&self) -> Result<CompletedTimings, AppError> {
        let table = read(&self.table);
        let mut timings = CompletedTimings::default();
        for job in table
            .by_id
            .values()
            .filter(|j| j.state == JobState::Completed)
        {
            timings.jobs += 1;
            timings.records += job.record_count;
            timings.total_duration += job.duration().unwrap_or(TimeDelta::zero());
        }
        Ok(timings)
    }
}

/// Result store held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryResultStore {
    records: Arc<RwLock<HashMap<Uuid, Vec<ExtractedRecord>>>>,
    max_page_size: usize,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max;
        self
    }
}

impl ResultStore for InMemoryResultStore {
    async fn append(
        &self,
        job_id: Uuid,
        records: Vec<SourceRecord>,
    ) -> Result<AppendOutcome, AppError> {
        let mut all = write(&self.records);
        let sequence = all.entry(job_id).or_default();
        let first_offset = sequence.len() as u64;
        let now = Utc::now();

        sequence.extend(records.into_iter().enumerate().map(|(i, record)| {
            ExtractedRecord {
                offset: first_offset + i as u64,
                external_id: record.external_id,
                data: record.data,
                created_at: now,
            }
        }));

        Ok(AppendOutcome {
            first_offset,
            len: sequence.len() as u64,
        })
    }

    async fn page(
        &self,
        job_id: Uuid,
        request: PageRequest,
    ) -> Result<Page<ExtractedRecord>, AppError> {
        let all = read(&self.records);
        Ok(match all.get(&job_id) {
            Some(sequence) => paginate(sequence, &request, self.max_page_size),
            None => Page::empty_at(request.offset()),
        })
    }

    async fn count(&self, job_id: Uuid) -> Result<u64, AppError> {
        Ok(read(&self.records)
            .get(&job_id)
            .map_or(0, |sequence| sequence.len() as u64))
    }

    async fn remove(&self, job_id: Uuid) -> Result<u64, AppError> {
        Ok(write(&self.records)
            .remove(&job_id)
            .map_or(0, |sequence| sequence.len() as u64))
    }

    async fn total_count(&self) -> Result<u64, AppError> {
        Ok(read(&self.records)
            .values()
            .map(|sequence| sequence.len() as u64)
            .sum())
    }
}
