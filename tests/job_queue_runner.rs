//! End-to-end scheduler behaviour over the in-memory store
//!
//! Short timers keep these on the wall clock; every wait is bounded.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use newsletter_queue::{
    config::JobQueueConfig,
    engine::{ScriptStep, ScriptedEngine},
    job_scheduling::{
        GenerationJob, InMemoryJobStore, JobId, JobQueueRunner, JobStatus, JobStore, JobUpdate,
        NewGenerationJob,
    },
};

fn fast_config() -> JobQueueConfig {
    JobQueueConfig {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        progress_update_interval: Duration::from_secs(10),
        stall_check_interval: Duration::from_secs(60),
        stall_timeout: Duration::from_secs(15 * 60),
    }
}

fn runner(
    store: &Arc<InMemoryJobStore>,
    engine: &Arc<ScriptedEngine>,
    config: JobQueueConfig,
) -> Arc<JobQueueRunner> {
    Arc::new(JobQueueRunner::new(store.clone(), engine.clone(), config))
}

/// Poll the store until `done` holds for the job, or give up after 5s
async fn wait_for<F>(store: &InMemoryJobStore, id: JobId, done: F) -> GenerationJob
where
    F: Fn(&GenerationJob) -> bool,
{
    let wait = async {
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting on job {id}"))
}

async fn wait_for_status(store: &InMemoryJobStore, id: JobId, status: JobStatus) -> GenerationJob {
    wait_for(store, id, |job| job.job_status == status).await
}

#[tokio::test]
async fn test_job_streams_to_completion() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::chunks(["He", "llo"]));
    let runner = runner(&store, &engine, fast_config());

    let job = store
        .enqueue(NewGenerationJob::new("Write this week's digest"))
        .await
        .unwrap();
    assert!(runner.start());

    let done = wait_for_status(&store, job.id, JobStatus::Completed).await;
    runner.stop().await;

    assert_eq!(done.output.as_deref(), Some("Hello"));
    assert_eq!(done.current_step.as_deref(), Some("Newsletter generation completed"));
    assert_eq!(done.progress.logs.first().map(String::as_str), Some("Job started"));
    assert_eq!(done.progress.last_log(), Some("Generation completed successfully"));
    assert!(done.error.is_none());

    let processed = done.processed_at.unwrap();
    let completed = done.completed_at.unwrap();
    assert!(done.created_at <= processed && processed <= completed);
    assert_eq!(engine.requests()[0].prompt, "Write this week's digest");
}

#[tokio::test]
async fn test_engine_failure_is_recorded_verbatim() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::Chunk("Dear".into()),
        ScriptStep::Fail("rate limited by provider".into()),
    ]));
    let runner = runner(&store, &engine, fast_config());

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    runner.start();

    let failed = wait_for_status(&store, job.id, JobStatus::Failed).await;
    runner.stop().await;

    assert_eq!(failed.error.as_deref(), Some("rate limited by provider"));
    assert_eq!(failed.current_step.as_deref(), Some("Failed during generation"));
    assert_eq!(failed.progress.last_log(), Some("Error: rate limited by provider"));
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn test_jobs_run_by_priority_one_at_a_time() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::Chunk("a".into()),
        ScriptStep::Delay(Duration::from_millis(40)),
        ScriptStep::Chunk("b".into()),
    ]));
    let runner = runner(&store, &engine, fast_config());

    let a = store
        .enqueue(NewGenerationJob::new("a").with_priority(1))
        .await
        .unwrap();
    let b = store
        .enqueue(NewGenerationJob::new("b").with_priority(5))
        .await
        .unwrap();
    let c = store
        .enqueue(NewGenerationJob::new("c").with_priority(1))
        .await
        .unwrap();

    // a second start must not add a second poller
    assert!(runner.start());
    assert!(!runner.start());

    for id in [a.id, b.id, c.id] {
        wait_for_status(&store, id, JobStatus::Completed).await;
    }
    runner.stop().await;

    let mut jobs = store.all().await;
    jobs.sort_by_key(|job| job.processed_at);
    assert_eq!(
        jobs.iter().map(|job| job.id).collect::<Vec<_>>(),
        vec![b.id, a.id, c.id]
    );

    for pair in jobs.windows(2) {
        assert!(pair[0].completed_at.unwrap() <= pair[1].processed_at.unwrap());
    }
    assert_eq!(engine.max_concurrent_streams(), 1);
}

#[tokio::test]
async fn test_cancel_before_pickup_never_runs() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::chunks(["never"]));
    let runner = runner(&store, &engine, fast_config());

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    let other = store.enqueue(NewGenerationJob::new("y")).await.unwrap();
    assert!(runner.cancel(job.id).await.unwrap());

    runner.start();
    wait_for_status(&store, other.id, JobStatus::Completed).await;
    runner.stop().await;

    let cancelled = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.job_status, JobStatus::Cancelled);
    assert_eq!(cancelled.current_step.as_deref(), Some("Cancelled by user"));
    assert_eq!(cancelled.progress.logs, vec!["Cancelled by user".to_string()]);
    assert!(cancelled.processed_at.is_none());
    assert!(cancelled.completed_at.is_some());

    let requests = engine.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].job_id, other.id);
}

#[tokio::test]
async fn test_cancel_while_running_keeps_partial_output() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::Chunk("partial".into()),
        ScriptStep::WaitForCancel,
        ScriptStep::Chunk(" never sent".into()),
    ]));
    let config = JobQueueConfig {
        progress_update_interval: Duration::ZERO,
        ..fast_config()
    };
    let runner = runner(&store, &engine, config);

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    runner.start();

    wait_for(&store, job.id, |job| {
        job.progress.last_log() == Some("Generated 7 characters so far...")
    })
    .await;
    assert_eq!(runner.status().current_job_id, Some(job.id));

    assert!(runner.cancel(job.id).await.unwrap());
    let cancelled = wait_for(&store, job.id, |job| job.output.is_some()).await;

    assert_eq!(cancelled.job_status, JobStatus::Cancelled);
    assert_eq!(cancelled.output.as_deref(), Some("partial"));
    assert_eq!(cancelled.current_step.as_deref(), Some("Cancelled by user"));
    assert!(
        !cancelled
            .progress
            .logs
            .contains(&"Generation completed successfully".to_string())
    );

    // a repeated cancel is a no-op
    assert!(!runner.cancel(job.id).await.unwrap());
    runner.stop().await;
    assert_eq!(runner.status().active_job_count, 0);
}

#[tokio::test]
async fn test_stalled_job_is_failed_and_queue_moves_on() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::chunks(["fresh"]));
    let config = JobQueueConfig {
        stall_check_interval: Duration::from_millis(30),
        stall_timeout: Duration::from_secs(60),
        ..fast_config()
    };
    let runner = runner(&store, &engine, config);

    // left running by a process that died an hour ago
    let orphan = store.enqueue(NewGenerationJob::new("orphan")).await.unwrap();
    let hour_ago = Utc::now() - ChronoDuration::hours(1);
    store
        .update(
            orphan.id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .processed_at(hour_ago)
                .heartbeat(hour_ago),
        )
        .await
        .unwrap();
    let next = store.enqueue(NewGenerationJob::new("next")).await.unwrap();

    runner.start();
    let failed = wait_for_status(&store, orphan.id, JobStatus::Failed).await;
    wait_for_status(&store, next.id, JobStatus::Completed).await;
    runner.stop().await;

    assert_eq!(
        failed.error.as_deref(),
        Some("Job stalled: processor stopped responding (no heartbeat for 1m)")
    );
    assert_eq!(
        failed.current_step.as_deref(),
        Some("Job stalled - no heartbeat detected")
    );
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn test_heartbeat_keeps_slow_job_alive() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::Delay(Duration::from_millis(400)),
        ScriptStep::Chunk("slow but alive".into()),
    ]));
    let config = JobQueueConfig {
        heartbeat_interval: Duration::from_millis(40),
        stall_check_interval: Duration::from_millis(30),
        stall_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let runner = runner(&store, &engine, config);

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    runner.start();

    let done = wait_for(&store, job.id, |job| job.job_status.is_terminal()).await;
    runner.stop().await;

    assert_eq!(done.job_status, JobStatus::Completed);
    assert_eq!(done.output.as_deref(), Some("slow but alive"));
    assert!(done.last_heartbeat.unwrap() > done.processed_at.unwrap());
}

#[tokio::test]
async fn test_terminal_jobs_are_never_rewritten() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::chunks(["done"]));
    let runner = runner(&store, &engine, fast_config());

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    runner.start();
    let completed = wait_for_status(&store, job.id, JobStatus::Completed).await;

    assert!(!runner.cancel(job.id).await.unwrap());
    assert_eq!(runner.detect_stalled_jobs().await.unwrap(), Vec::<JobId>::new());
    runner.stop().await;

    assert_eq!(store.get(job.id).await.unwrap().unwrap(), completed);
    assert_eq!(engine.requests().len(), 1);
}

#[tokio::test]
async fn test_stop_cancels_the_running_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let engine = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::Chunk("half a newsletter".into()),
        ScriptStep::WaitForCancel,
    ]));
    let config = JobQueueConfig {
        progress_update_interval: Duration::ZERO,
        ..fast_config()
    };
    let runner = runner(&store, &engine, config);

    let job = store.enqueue(NewGenerationJob::new("x")).await.unwrap();
    runner.start();
    wait_for(&store, job.id, |job| {
        job.progress.last_log() == Some("Generated 17 characters so far...")
    })
    .await;
    assert_eq!(runner.status().current_job_id, Some(job.id));

    runner.stop().await;

    let status = runner.status();
    assert!(!status.is_running);
    assert_eq!(status.current_job_id, None);
    assert_eq!(status.active_job_count, 0);

    let stopped = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stopped.job_status, JobStatus::Cancelled);
    assert_eq!(stopped.output.as_deref(), Some("half a newsletter"));
}
