//! Stalled job detection
//!
//! Fails `running` jobs whose heartbeat went quiet, regardless of which
//! process started them.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::job_store::JobStore;
use super::types::{JobId, JobStatus, JobUpdate};
use crate::errors::RepositoryResult;

pub const STEP_STALLED: &str = "Job stalled - no heartbeat detected";

pub struct StalledJobDetector {
    store: Arc<dyn JobStore>,
    stall_timeout: Duration,
}

impl StalledJobDetector {
    pub fn new(store: Arc<dyn JobStore>, stall_timeout: Duration) -> Self {
        Self {
            store,
            stall_timeout,
        }
    }

    pub fn stall_error(&self) -> String {
        format!(
            "Job stalled: processor stopped responding (no heartbeat for {})",
            humantime::format_duration(self.stall_timeout)
        )
    }

    /// One detection pass; returns the jobs it failed
    pub async fn detect_once(&self) -> RepositoryResult<Vec<JobId>> {
        let timeout = chrono::Duration::from_std(self.stall_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stalled = self.store.find_stalled(cutoff).await?;
        if stalled.is_empty() {
            debug!("No stalled jobs found");
            return Ok(Vec::new());
        }

        let message = self.stall_error();
        let mut failed = Vec::with_capacity(stalled.len());
        for job in stalled {
            let update = JobUpdate::new()
                .status(JobStatus::Failed)
                .error(message.clone())
                .completed_at(Utc::now())
                .step(STEP_STALLED)
                .log(format!("Error: {message}"));

            // the job may have finished or heartbeated since the scan
            match self
                .store
                .transition(job.id, &[JobStatus::Running], update)
                .await
            {
                Ok(true) => {
                    warn!(
                        "Marked stalled job {} as failed (last heartbeat: {})",
                        job.id,
                        job.liveness_at().format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    failed.push(job.id);
                }
                Ok(false) => debug!("Stalled job {} settled before it could be failed", job.id),
                Err(e) => warn!("Failed to mark stalled job {} as failed: {}", job.id, e),
            }
        }

        Ok(failed)
    }
}
