//! Job queue runner: the scheduler for newsletter generation jobs
//!
//! Owns the poll loop, the stall detector loop, and the single execution
//! slot. One instance per process, shared as `Arc<JobQueueRunner>`.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cancellation::CancellationRegistry;
use super::job_executor::{JobExecutor, STEP_CANCELLED, STEP_FAILED_TO_START};
use super::job_store::JobStore;
use super::stall_detector::StalledJobDetector;
use super::types::{JobId, JobSchedulingError, JobStatus, JobUpdate, SchedulerStatus};
use crate::config::JobQueueConfig;
use crate::engine::GenerationEngine;

/// Background loops spawned by `start`
struct RunningLoops {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct JobQueueRunner {
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    stall_detector: StalledJobDetector,
    registry: CancellationRegistry,
    config: JobQueueConfig,
    /// Held for the whole of one job's execution
    execution_slot: AsyncMutex<()>,
    loops: Mutex<Option<RunningLoops>>,
}

impl JobQueueRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn GenerationEngine>,
        config: JobQueueConfig,
    ) -> Self {
        let registry = CancellationRegistry::new();
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            engine,
            registry.clone(),
            &config,
        ));
        let stall_detector = StalledJobDetector::new(store.clone(), config.stall_timeout);

        Self {
            store,
            executor,
            stall_detector,
            registry,
            config,
            execution_slot: AsyncMutex::new(()),
            loops: Mutex::new(None),
        }
    }

    fn lock_loops(&self) -> MutexGuard<'_, Option<RunningLoops>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the poll and stall-detector loops
    ///
    /// Idempotent: returns `false` when the loops were already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut loops = self.lock_loops();
        if loops.is_some() {
            debug!("Job queue runner already started");
            return false;
        }

        self.registry.reopen();
        let shutdown = CancellationToken::new();
        let poll = tokio::spawn(self.clone().run_poll_loop(shutdown.clone()));
        let stall = tokio::spawn(self.clone().run_stall_loop(shutdown.clone()));
        *loops = Some(RunningLoops {
            shutdown,
            handles: vec![poll, stall],
        });

        info!(
            "Job queue runner started (poll: {}, stall check: {}, stall timeout: {})",
            humantime::format_duration(self.config.poll_interval),
            humantime::format_duration(self.config.stall_check_interval),
            humantime::format_duration(self.config.stall_timeout)
        );
        true
    }

    /// Cancel the executing job, stop both loops and wait for them
    pub async fn stop(&self) {
        let loops = self.lock_loops().take();
        let Some(loops) = loops else {
            debug!("Job queue runner not running");
            return;
        };

        // closing first means a job picked up from here on never starts
        loops.shutdown.cancel();
        if let Some(job_id) = self.registry.close() {
            info!("Stopping job queue runner, cancelling job {}", job_id);
            if let Err(e) = self.cancel(job_id).await {
                error!("Failed to cancel job {} during shutdown: {}", job_id, e);
                // still unwind the execution so the loop can exit
                self.registry.cancel(job_id);
            }
        }

        for handle in loops.handles {
            if let Err(e) = handle.await {
                error!("Job queue runner loop ended abnormally: {}", e);
            }
        }
        info!("Job queue runner stopped");
    }

    /// Cancel a queued or running job
    ///
    /// Returns `Ok(false)` when the job had already reached a terminal
    /// state; nothing is written in that case.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, JobSchedulingError> {
        let update = JobUpdate::new()
            .status(JobStatus::Cancelled)
            .completed_at(Utc::now())
            .step(STEP_CANCELLED)
            .log(STEP_CANCELLED);

        let cancelled = self
            .store
            .transition(job_id, &JobStatus::ACTIVE, update)
            .await?;

        if !cancelled {
            return match self.store.get(job_id).await? {
                Some(job) => {
                    debug!(
                        "Job {} already {}, nothing to cancel",
                        job_id, job.job_status
                    );
                    Ok(false)
                }
                None => Err(JobSchedulingError::JobNotFound { id: job_id }),
            };
        }

        if self.registry.cancel(job_id) {
            info!("Cancelled job {} and signalled its execution", job_id);
        } else {
            info!("Cancelled job {}", job_id);
        }
        Ok(true)
    }

    /// Non-authoritative snapshot for health reporting
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.lock_loops().is_some(),
            current_job_id: self.registry.current_job(),
            active_job_count: self.registry.active_count(),
        }
    }

    /// One poll tick: execute the next queued job if the slot is free
    ///
    /// Returns the id of the job that was picked up, if any.
    pub async fn poll_once(&self) -> Result<Option<JobId>, JobSchedulingError> {
        let Ok(_slot) = self.execution_slot.try_lock() else {
            debug!(
                "Job {:?} still executing, skipping poll tick",
                self.registry.current_job()
            );
            return Ok(None);
        };

        let Some(job) = self.store.find_next_queued().await? else {
            return Ok(None);
        };
        let job_id = job.id;
        if self.registry.is_closed() {
            debug!("Runner is stopping, leaving job {} queued", job_id);
            return Ok(None);
        }
        debug!("Picked up job {} (priority: {})", job_id, job.priority);

        // an execution panic surfaces here as a JoinError
        let executor = self.executor.clone();
        match tokio::spawn(async move { executor.execute(job).await }).await {
            Ok(outcome) => debug!("Job {} finished: {:?}", job_id, outcome),
            Err(e) => {
                error!("Execution of job {} aborted: {}", job_id, e);
                let update = JobUpdate::new()
                    .status(JobStatus::Failed)
                    .error(format!("Job execution aborted: {e}"))
                    .completed_at(Utc::now())
                    .step(STEP_FAILED_TO_START);
                if let Err(e) = self
                    .store
                    .transition(job_id, &JobStatus::ACTIVE, update)
                    .await
                {
                    warn!("Failed to mark aborted job {} as failed: {}", job_id, e);
                }
            }
        }

        Ok(Some(job_id))
    }

    /// One stall-detector tick; returns the jobs it failed
    pub async fn detect_stalled_jobs(&self) -> Result<Vec<JobId>, JobSchedulingError> {
        let failed = self.stall_detector.detect_once().await?;
        for job_id in &failed {
            // our own execution lost its heartbeat; stop it streaming
            if self.registry.cancel(*job_id) {
                warn!("Stopped local execution of stalled job {}", job_id);
            }
        }
        Ok(failed)
    }

    async fn run_poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Error processing queued jobs: {}", e);
                    }
                }
            }
        }
        debug!("Poll loop stopped");
    }

    async fn run_stall_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.detect_stalled_jobs().await {
                        Ok(failed) if !failed.is_empty() => {
                            warn!("Recovered {} stalled job(s)", failed.len());
                        }
                        Ok(_) => {}
                        Err(e) => error!("Error detecting stalled jobs: {}", e),
                    }
                }
            }
        }
        debug!("Stall detector loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::errors::RepositoryResult;
    use crate::job_scheduling::memory_store::InMemoryJobStore;
    use crate::job_scheduling::types::{GenerationJob, NewGenerationJob};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn runner(store: Arc<InMemoryJobStore>) -> Arc<JobQueueRunner> {
        Arc::new(JobQueueRunner::new(
            store,
            Arc::new(ScriptedEngine::chunks(["ok"])),
            JobQueueConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let runner = runner(Arc::new(InMemoryJobStore::new()));
        let result = runner.cancel(JobId(404)).await;
        assert!(matches!(
            result,
            Err(JobSchedulingError::JobNotFound { id }) if id == JobId(404)
        ));
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_noop() {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = runner(store.clone());
        let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), Some(job.id));
        assert!(!runner.cancel(job.id).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status, JobStatus::Completed);
        assert_eq!(stored.current_step.as_deref(), Some("Newsletter generation completed"));
    }

    #[tokio::test]
    async fn test_poll_once_with_empty_queue() {
        let runner = runner(Arc::new(InMemoryJobStore::new()));
        assert_eq!(runner.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_resets_status() {
        let runner = runner(Arc::new(InMemoryJobStore::new()));
        assert!(!runner.status().is_running);

        assert!(runner.start());
        assert!(!runner.start());
        assert!(runner.status().is_running);

        runner.stop().await;
        let status = runner.status();
        assert!(!status.is_running);
        assert_eq!(status.current_job_id, None);
        assert_eq!(status.active_job_count, 0);

        // restartable after a stop
        assert!(runner.start());
        runner.stop().await;
    }

    /// Holds `find_next_queued` open until released
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryJobStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl JobStore for GatedStore {
        async fn enqueue(&self, job: NewGenerationJob) -> RepositoryResult<GenerationJob> {
            self.inner.enqueue(job).await
        }
        async fn find_next_queued(&self) -> RepositoryResult<Option<GenerationJob>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.find_next_queued().await
        }
        async fn get(&self, id: JobId) -> RepositoryResult<Option<GenerationJob>> {
            self.inner.get(id).await
        }
        async fn update(&self, id: JobId, update: JobUpdate) -> RepositoryResult<bool> {
            self.inner.update(id, update).await
        }
        async fn transition(
            &self,
            id: JobId,
            from: &[JobStatus],
            update: JobUpdate,
        ) -> RepositoryResult<bool> {
            self.inner.transition(id, from, update).await
        }
        async fn find_stalled(
            &self,
            older_than: DateTime<Utc>,
        ) -> RepositoryResult<Vec<GenerationJob>> {
            self.inner.find_stalled(older_than).await
        }
    }

    #[tokio::test]
    async fn test_stop_during_pickup_leaves_job_queued() {
        let store = Arc::new(GatedStore::default());
        let engine = Arc::new(ScriptedEngine::chunks(["never"]));
        let runner = Arc::new(JobQueueRunner::new(
            store.clone(),
            engine.clone(),
            JobQueueConfig::default(),
        ));
        let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();

        runner.start();
        store.entered.notified().await;

        let stopping = tokio::spawn({
            let runner = runner.clone();
            async move { runner.stop().await }
        });
        while !runner.registry.is_closed() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // the poll tick now sees the job it was about to pick up
        store.release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), stopping)
            .await
            .expect("stop waited on a generation")
            .unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status, JobStatus::Queued);
        assert!(stored.progress.logs.is_empty());
        assert!(engine.requests().is_empty());
    }
}
