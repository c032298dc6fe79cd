//! Persistence port for generation jobs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tracing::warn;

use super::types::{GenerationJob, JobId, JobStatus, JobUpdate, NewGenerationJob};
use crate::errors::RepositoryResult;

/// Durable storage of generation jobs
///
/// The store is the single source of truth for job state. Every write is a
/// partial, field-level update of one row; no cross-row transactions are
/// required.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `queued` state
    async fn enqueue(&self, job: NewGenerationJob) -> RepositoryResult<GenerationJob>;

    /// Highest-priority, oldest queued job
    async fn find_next_queued(&self) -> RepositoryResult<Option<GenerationJob>>;

    async fn get(&self, id: JobId) -> RepositoryResult<Option<GenerationJob>>;

    /// Unconditional partial update. Returns `false` when the job does not exist.
    async fn update(&self, id: JobId, update: JobUpdate) -> RepositoryResult<bool>;

    /// Compare-and-set partial update
    ///
    /// Applies `update` only while the stored status is one of `from` and
    /// any status change it carries is a legal successor (see [`admits`]).
    /// Returns `false` (and writes nothing) otherwise.
    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        update: JobUpdate,
    ) -> RepositoryResult<bool>;

    /// Running jobs whose last sign of life is older than `older_than`
    async fn find_stalled(&self, older_than: DateTime<Utc>) -> RepositoryResult<Vec<GenerationJob>>;
}

/// Dequeue order: priority descending, then creation time, then id
pub fn queue_order(a: &GenerationJob, b: &GenerationJob) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Guard shared by every `transition` implementation
pub fn admits(id: JobId, current: JobStatus, from: &[JobStatus], update: &JobUpdate) -> bool {
    if !from.contains(&current) {
        return false;
    }
    match update.job_status {
        Some(next) if !current.can_transition_to(next) => {
            warn!("Refusing illegal transition of job {}: {} -> {}", id, current, next);
            false
        }
        _ => true,
    }
}

/// Whether a job counts as stalled at the given cutoff
pub fn is_stalled(job: &GenerationJob, older_than: DateTime<Utc>) -> bool {
    job.job_status == JobStatus::Running && job.liveness_at() < older_than
}
