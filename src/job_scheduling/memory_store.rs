//! In-process job store
//!
//! Backs the binary's `--in-memory` mode and the scheduler tests. State is
//! lost when the process exits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::job_store::{JobStore, admits, is_stalled, queue_order};
use super::types::{GenerationJob, JobId, JobStatus, JobUpdate, NewGenerationJob};
use crate::errors::RepositoryResult;

#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, GenerationJob>>,
    next_id: AtomicI64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Snapshot of every stored job, ordered by id
    pub async fn all(&self) -> Vec<GenerationJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewGenerationJob) -> RepositoryResult<GenerationJob> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = GenerationJob::queued(id, job, Utc::now());
        self.jobs.write().await.insert(id, job.clone());
        debug!("Enqueued job {} (priority: {})", id, job.priority);
        Ok(job)
    }

    async fn find_next_queued(&self) -> RepositoryResult<Option<GenerationJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.job_status == JobStatus::Queued)
            .min_by(|a, b| queue_order(a, b))
            .cloned())
    }

    async fn get(&self, id: JobId) -> RepositoryResult<Option<GenerationJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> RepositoryResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                job.apply(&update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        update: JobUpdate,
    ) -> RepositoryResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if admits(id, job.job_status, from, &update) => {
                job.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> RepositoryResult<Vec<GenerationJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| is_stalled(job, older_than))
            .cloned()
            .collect())
    }
}
