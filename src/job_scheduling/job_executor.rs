//! Job executor: drives one generation job from `queued` to a terminal state

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cancellation::CancellationRegistry;
use super::job_store::JobStore;
use super::types::{ExecutionOutcome, GenerationJob, JobId, JobStatus, JobUpdate};
use crate::config::JobQueueConfig;
use crate::engine::{GenerationEngine, GenerationError, GenerationRequest};

pub const STEP_STARTING: &str = "Starting newsletter generation";
pub const STEP_COMPLETED: &str = "Newsletter generation completed";
pub const STEP_FAILED: &str = "Failed during generation";
pub const STEP_FAILED_TO_START: &str = "Failed to start";
pub const STEP_CANCELLED: &str = "Cancelled by user";

pub const LOG_STARTED: &str = "Job started";
pub const LOG_COMPLETED: &str = "Generation completed successfully";

fn progress_label(characters: usize) -> String {
    format!("Generated {characters} characters so far...")
}

/// How the chunk-consumption loop ended
enum StreamEnd {
    Finished,
    Cancelled,
    Engine(GenerationError),
}

/// Executes generation jobs against a store and an engine
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn GenerationEngine>,
    registry: CancellationRegistry,
    heartbeat_interval: Duration,
    progress_update_interval: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn GenerationEngine>,
        registry: CancellationRegistry,
        config: &JobQueueConfig,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            heartbeat_interval: config.heartbeat_interval,
            progress_update_interval: config.progress_update_interval,
        }
    }

    /// Run one job to completion, failure or cancellation
    ///
    /// Never returns an error: engine failures become `failed` rows and
    /// store failures are logged.
    pub async fn execute(&self, job: GenerationJob) -> ExecutionOutcome {
        let job_id = job.id;
        // registered before the claim so a cancel racing the claim is observed
        let (token, _active) = self.registry.register(job_id);
        if token.is_cancelled() {
            debug!("Runner is stopping, leaving job {} queued", job_id);
            return ExecutionOutcome::Skipped;
        }

        let started_at = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("startedAt".to_string(), json!(started_at));

        let claim = JobUpdate::new()
            .status(JobStatus::Running)
            .processed_at(started_at)
            .heartbeat(started_at)
            .step(STEP_STARTING)
            .log(LOG_STARTED)
            .metadata(metadata.clone());

        match self
            .store
            .transition(job_id, &[JobStatus::Queued], claim)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {} is no longer queued, skipping", job_id);
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                return self
                    .fail_to_start(job_id, &[JobStatus::Queued, JobStatus::Running], e.to_string())
                    .await;
            }
        }

        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                return self
                    .fail_to_start(job_id, &[JobStatus::Running], "Job disappeared after pickup")
                    .await;
            }
            Err(e) => {
                return self
                    .fail_to_start(job_id, &[JobStatus::Running], e.to_string())
                    .await;
            }
        };

        info!(
            "Starting newsletter generation for job {} (priority: {})",
            job_id, job.priority
        );

        let heartbeat = Heartbeat::spawn(
            self.store.clone(),
            job_id,
            self.heartbeat_interval,
            token.clone(),
        );

        let request = GenerationRequest {
            job_id,
            prompt: job.prompt.clone(),
            trace_id: job.trace_id.clone(),
        };

        let mut output = String::new();
        let mut characters = 0usize;
        let end = match self.engine.stream(request, token.clone()).await {
            Err(e) => StreamEnd::Engine(e),
            Ok(mut chunks) => {
                let mut last_progress = Instant::now();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => break StreamEnd::Cancelled,
                        next = chunks.next() => next,
                    };

                    match next {
                        Some(Ok(chunk)) => {
                            if token.is_cancelled() {
                                break StreamEnd::Cancelled;
                            }
                            characters += chunk.chars().count();
                            output.push_str(&chunk);

                            if last_progress.elapsed() >= self.progress_update_interval {
                                self.persist_progress(job_id, characters, &mut metadata).await;
                                last_progress = Instant::now();
                            }
                        }
                        Some(Err(e)) => break StreamEnd::Engine(e),
                        None => break StreamEnd::Finished,
                    }
                }
            }
        };

        // timers go before any terminal write
        heartbeat.stop().await;

        match end {
            StreamEnd::Finished if !token.is_cancelled() => {
                self.complete(job_id, output, characters, metadata).await
            }
            StreamEnd::Engine(e) if !token.is_cancelled() => self.fail(job_id, e).await,
            _ => self.record_cancellation(job_id, output, characters).await,
        }
    }

    async fn persist_progress(
        &self,
        job_id: JobId,
        characters: usize,
        metadata: &mut Map<String, Value>,
    ) {
        let label = progress_label(characters);
        metadata.insert("outputLength".to_string(), json!(characters));
        metadata.insert("lastUpdate".to_string(), json!(Utc::now()));

        let update = JobUpdate::new()
            .step(label.clone())
            .log(label)
            .metadata(metadata.clone());

        match self
            .store
            .transition(job_id, &[JobStatus::Running], update)
            .await
        {
            Ok(_) => debug!("Job {} progress: {} characters", job_id, characters),
            Err(e) => warn!("Failed to persist progress for job {}: {}", job_id, e),
        }
    }

    async fn complete(
        &self,
        job_id: JobId,
        output: String,
        characters: usize,
        mut metadata: Map<String, Value>,
    ) -> ExecutionOutcome {
        let completed_at = Utc::now();
        metadata.insert("outputLength".to_string(), json!(characters));
        metadata.insert("completedAt".to_string(), json!(completed_at));

        let update = JobUpdate::new()
            .status(JobStatus::Completed)
            .output(output)
            .completed_at(completed_at)
            .step(STEP_COMPLETED)
            .log(LOG_COMPLETED)
            .metadata(metadata);

        match self
            .store
            .transition(job_id, &[JobStatus::Running], update)
            .await
        {
            Ok(true) => {
                info!(
                    "Job {} completed successfully ({} characters)",
                    job_id, characters
                );
                ExecutionOutcome::Completed
            }
            Ok(false) => self.settled_elsewhere(job_id).await,
            Err(e) => {
                error!(
                    "Failed to persist completion of job {}, leaving it to the stall detector: {}",
                    job_id, e
                );
                ExecutionOutcome::Failed
            }
        }
    }

    async fn fail(&self, job_id: JobId, err: GenerationError) -> ExecutionOutcome {
        let message = err.to_string();
        error!("Job {} failed: {}", job_id, message);

        let update = JobUpdate::new()
            .status(JobStatus::Failed)
            .error(message.clone())
            .completed_at(Utc::now())
            .step(STEP_FAILED)
            .log(format!("Error: {message}"));

        match self
            .store
            .transition(job_id, &[JobStatus::Running], update)
            .await
        {
            Ok(true) => ExecutionOutcome::Failed,
            Ok(false) => self.settled_elsewhere(job_id).await,
            Err(e) => {
                error!(
                    "Failed to persist failure of job {}, leaving it to the stall detector: {}",
                    job_id, e
                );
                ExecutionOutcome::Failed
            }
        }
    }

    /// Setup failure: the job never reached its generation step
    async fn fail_to_start<S: Into<String>>(
        &self,
        job_id: JobId,
        from: &[JobStatus],
        message: S,
    ) -> ExecutionOutcome {
        let message = message.into();
        error!("Job {} failed to start: {}", job_id, message);

        let update = JobUpdate::new()
            .status(JobStatus::Failed)
            .error(message.clone())
            .completed_at(Utc::now())
            .step(STEP_FAILED_TO_START)
            .log(format!("Error: {message}"));

        if let Err(e) = self.store.transition(job_id, from, update).await {
            error!("Failed to mark job {} as failed: {}", job_id, e);
        }
        ExecutionOutcome::Failed
    }

    /// Keep whatever was consumed before the signal; the status was written by the canceller
    async fn record_cancellation(
        &self,
        job_id: JobId,
        output: String,
        characters: usize,
    ) -> ExecutionOutcome {
        info!(
            "Job {} cancelled after {} characters",
            job_id, characters
        );

        if output.is_empty() {
            return self.settled_elsewhere(job_id).await;
        }

        let update = JobUpdate::new().output(output);
        match self
            .store
            .transition(job_id, &[JobStatus::Cancelled], update)
            .await
        {
            Ok(true) => ExecutionOutcome::Cancelled,
            // stopped because the job was failed elsewhere
            Ok(false) => self.settled_elsewhere(job_id).await,
            Err(e) => {
                warn!("Failed to persist partial output for job {}: {}", job_id, e);
                ExecutionOutcome::Cancelled
            }
        }
    }

    /// Someone else wrote the terminal state; report what it was
    async fn settled_elsewhere(&self, job_id: JobId) -> ExecutionOutcome {
        match self.store.get(job_id).await {
            Ok(Some(job)) => {
                info!(
                    "Job {} was already {} when execution finished",
                    job_id, job.job_status
                );
                match job.job_status {
                    JobStatus::Cancelled => ExecutionOutcome::Cancelled,
                    JobStatus::Completed => ExecutionOutcome::Completed,
                    _ => ExecutionOutcome::Failed,
                }
            }
            _ => ExecutionOutcome::Failed,
        }
    }
}

/// Periodic liveness writes for a running job
///
/// Runs on its own task so heartbeats keep flowing while the consumption
/// loop is parked on the engine. Dropping the handle stops the task. When a
/// tick finds the job settled by someone else (a cancel from another
/// process, or the stall detector) the execution token is cancelled.
struct Heartbeat {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        period: Duration,
        execution: CancellationToken,
    ) -> Self {
        let stop = execution.child_token();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let now: DateTime<Utc> = Utc::now();
                        match store
                            .transition(job_id, &[JobStatus::Running], JobUpdate::new().heartbeat(now))
                            .await
                        {
                            Ok(true) => debug!("Heartbeat for job {}", job_id),
                            Ok(false) => {
                                info!("Job {} is no longer running, stopping its execution", job_id);
                                execution.cancel();
                                break;
                            }
                            Err(e) => warn!("Failed to update heartbeat for job {}: {}", job_id, e),
                        }
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop ticking and wait for an in-flight write to finish
    async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
