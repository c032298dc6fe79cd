//! SeaORM-based generation job repository
//!
//! Durable [`JobStore`] over the `newsletter_generations` table. Each write
//! runs in its own transaction with the row locked, so log appends and the
//! compare-and-set in `transition` are atomic per row.
//!
//! SQLite ignores `FOR UPDATE`, so on that backend writers in one process
//! also queue on a shared lock, and every write retries on `database is
//! locked` to ride out writers in other processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    IntoActiveModel, NotSet, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::database::retry::{RetryConfig, with_retry};
use crate::entities::{newsletter_generations, prelude::NewsletterGenerations};
use crate::errors::{RepositoryError, RepositoryResult};
use crate::job_scheduling::job_store::{JobStore, admits, is_stalled};
use crate::job_scheduling::{
    GenerationJob, JobId, JobProgress, JobStatus, JobUpdate, NewGenerationJob,
};

/// Value written to the legacy `status` column for a scheduler state
pub fn legacy_status(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "pending",
        other => other.as_str(),
    }
}

/// SeaORM-based repository for generation jobs
#[derive(Clone)]
pub struct GenerationJobSeaOrmRepository {
    connection: Arc<DatabaseConnection>,
    /// Shared by every repository over the same SQLite database
    write_lock: Option<Arc<Mutex<()>>>,
    retry: RetryConfig,
}

impl GenerationJobSeaOrmRepository {
    pub fn new(connection: Arc<DatabaseConnection>, write_lock: Option<Arc<Mutex<()>>>) -> Self {
        Self {
            connection,
            write_lock,
            retry: RetryConfig::for_writes(),
        }
    }

    async fn serialize_writes(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Most recent jobs first, optionally restricted to one status
    pub async fn list_recent(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> RepositoryResult<Vec<GenerationJob>> {
        let mut query = NewsletterGenerations::find();
        if let Some(status) = status {
            query = query.filter(newsletter_generations::Column::JobStatus.eq(status.as_str()));
        }
        let models = query
            .order_by_desc(newsletter_generations::Column::CreatedAt)
            .order_by_desc(newsletter_generations::Column::Id)
            .limit(limit)
            .all(&*self.connection)
            .await?;

        models.into_iter().map(model_to_domain).collect()
    }

    /// Apply `update` to one row if its status passes `guard`
    async fn apply_update(
        &self,
        id: JobId,
        guard: Option<&[JobStatus]>,
        update: JobUpdate,
    ) -> RepositoryResult<bool> {
        let _serialized = self.serialize_writes().await;
        let update = &update;
        with_retry(
            &self.retry,
            move || self.apply_once(id, guard, update),
            "update generation job",
        )
        .await
    }

    async fn apply_once(
        &self,
        id: JobId,
        guard: Option<&[JobStatus]>,
        update: &JobUpdate,
    ) -> RepositoryResult<bool> {
        // dropping an uncommitted transaction rolls it back
        let txn = self.connection.begin().await?;
        let applied = Self::apply_in_transaction(&txn, id, guard, update).await?;
        txn.commit().await?;
        Ok(applied)
    }

    async fn apply_in_transaction(
        txn: &DatabaseTransaction,
        id: JobId,
        guard: Option<&[JobStatus]>,
        update: &JobUpdate,
    ) -> RepositoryResult<bool> {
        let Some(model) = NewsletterGenerations::find_by_id(id.as_i64())
            .lock_exclusive()
            .one(txn)
            .await?
        else {
            return Ok(false);
        };

        let mut job = model_to_domain(model.clone())?;
        if let Some(allowed) = guard {
            if !admits(id, job.job_status, allowed, update) {
                debug!(
                    "Skipping update of job {}: status {} not admitted by {:?}",
                    id, job.job_status, allowed
                );
                return Ok(false);
            }
        }
        if update.is_empty() {
            return Ok(true);
        }

        job.apply(update);

        let mut active = model.into_active_model();
        if update.job_status.is_some() {
            active.job_status = Set(job.job_status.as_str().to_string());
            active.status = Set(legacy_status(job.job_status).to_string());
        }
        if update.output.is_some() {
            active.output = Set(job.output.clone());
        }
        if update.error.is_some() {
            active.error = Set(job.error.clone());
        }
        if update.current_step.is_some() {
            active.current_step = Set(job.current_step.clone());
        }
        if !update.append_logs.is_empty() || update.metadata.is_some() {
            active.progress = Set(serde_json::to_string(&job.progress)?);
        }
        if update.last_heartbeat.is_some() {
            active.last_heartbeat = Set(job.last_heartbeat);
        }
        if update.processed_at.is_some() {
            active.processed_at = Set(job.processed_at);
        }
        if update.completed_at.is_some() {
            active.completed_at = Set(job.completed_at);
        }

        active.update(txn).await?;
        Ok(true)
    }
}

fn model_to_domain(model: newsletter_generations::Model) -> RepositoryResult<GenerationJob> {
    let progress = if model.progress.trim().is_empty() {
        JobProgress::default()
    } else {
        serde_json::from_str(&model.progress)?
    };

    Ok(GenerationJob {
        id: JobId(model.id),
        job_status: JobStatus::from_str(&model.job_status)?,
        priority: model.priority,
        created_at: model.created_at,
        prompt: model.prompt,
        trace_id: model.trace_id,
        output: model.output,
        error: model.error,
        current_step: model.current_step,
        progress,
        last_heartbeat: model.last_heartbeat,
        processed_at: model.processed_at,
        completed_at: model.completed_at,
    })
}

#[async_trait]
impl JobStore for GenerationJobSeaOrmRepository {
    async fn enqueue(&self, job: NewGenerationJob) -> RepositoryResult<GenerationJob> {
        let active = newsletter_generations::ActiveModel {
            id: NotSet,
            status: Set(legacy_status(JobStatus::Queued).to_string()),
            job_status: Set(JobStatus::Queued.as_str().to_string()),
            priority: Set(job.priority),
            created_at: Set(Utc::now()),
            prompt: Set(job.prompt),
            trace_id: Set(job.trace_id),
            output: Set(None),
            error: Set(None),
            current_step: Set(None),
            progress: Set(serde_json::to_string(&JobProgress::default())?),
            last_heartbeat: Set(None),
            processed_at: Set(None),
            completed_at: Set(None),
        };

        let _serialized = self.serialize_writes().await;
        let active = &active;
        let connection = &*self.connection;
        let model = with_retry(
            &self.retry,
            move || async move { Ok::<_, RepositoryError>(active.clone().insert(connection).await?) },
            "insert generation job",
        )
        .await?;
        debug!("Inserted generation job {} (priority: {})", model.id, model.priority);
        model_to_domain(model)
    }

    async fn find_next_queued(&self) -> RepositoryResult<Option<GenerationJob>> {
        let model = NewsletterGenerations::find()
            .filter(newsletter_generations::Column::JobStatus.eq(JobStatus::Queued.as_str()))
            .order_by_desc(newsletter_generations::Column::Priority)
            .order_by_asc(newsletter_generations::Column::CreatedAt)
            .order_by_asc(newsletter_generations::Column::Id)
            .one(&*self.connection)
            .await?;

        model.map(model_to_domain).transpose()
    }

    async fn get(&self, id: JobId) -> RepositoryResult<Option<GenerationJob>> {
        let model = NewsletterGenerations::find_by_id(id.as_i64())
            .one(&*self.connection)
            .await?;

        model.map(model_to_domain).transpose()
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> RepositoryResult<bool> {
        self.apply_update(id, None, update).await
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        update: JobUpdate,
    ) -> RepositoryResult<bool> {
        self.apply_update(id, Some(from), update).await
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> RepositoryResult<Vec<GenerationJob>> {
        // heartbeat falls back across three columns, so the cutoff is applied here
        let running = NewsletterGenerations::find()
            .filter(newsletter_generations::Column::JobStatus.eq(JobStatus::Running.as_str()))
            .all(&*self.connection)
            .await?;

        let mut stalled = Vec::new();
        for model in running {
            let job = model_to_domain(model)?;
            if is_stalled(&job, older_than) {
                stalled.push(job);
            }
        }
        Ok(stalled)
    }
}
