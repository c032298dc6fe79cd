//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::errors::RepositoryError;

/// Store-assigned identifier of a newsletter generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(JobId)
    }
}

/// Scheduler state machine for a job
///
/// `Queued -> Running -> {Completed, Failed, Cancelled}`, plus
/// `Queued -> Cancelled` when a job is cancelled before pickup and
/// `Queued -> Failed` when it cannot even be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Queued, JobStatus::Cancelled) => true,
            (JobStatus::Running, JobStatus::Completed)
            | (JobStatus::Running, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(RepositoryError::InvalidValue {
                field: "job_status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Structured progress bag: append-only log plus overwritable metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobProgress {
    pub fn push_log<S: Into<String>>(&mut self, entry: S) {
        self.logs.push(entry.into());
    }

    pub fn last_log(&self) -> Option<&str> {
        self.logs.last().map(String::as_str)
    }

    /// Apply the progress portion of a partial update
    pub fn apply(&mut self, update: &JobUpdate) {
        for entry in &update.append_logs {
            self.push_log(entry.clone());
        }
        if let Some(metadata) = &update.metadata {
            self.metadata = metadata.clone();
        }
    }
}

/// A newsletter generation job as persisted by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub id: JobId,
    pub job_status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub prompt: String,
    pub trace_id: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub current_step: Option<String>,
    pub progress: JobProgress,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// Build a freshly queued job
    pub fn queued(id: JobId, new_job: NewGenerationJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            job_status: JobStatus::Queued,
            priority: new_job.priority,
            created_at,
            prompt: new_job.prompt,
            trace_id: new_job.trace_id,
            output: None,
            error: None,
            current_step: None,
            progress: JobProgress::default(),
            last_heartbeat: None,
            processed_at: None,
            completed_at: None,
        }
    }

    /// Most recent liveness timestamp for stall detection
    ///
    /// Falls back to `processed_at` and then `created_at` when the job was
    /// marked running but no heartbeat was ever written.
    pub fn liveness_at(&self) -> DateTime<Utc> {
        self.last_heartbeat
            .or(self.processed_at)
            .unwrap_or(self.created_at)
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.job_status {
            self.job_status = status;
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(step) = &update.current_step {
            self.current_step = Some(step.clone());
        }
        self.progress.apply(update);
        if let Some(at) = update.last_heartbeat {
            self.last_heartbeat = Some(at);
        }
        if let Some(at) = update.processed_at {
            self.processed_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
    }
}

/// Input for creating a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGenerationJob {
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl NewGenerationJob {
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self {
            prompt: prompt.into(),
            priority: 0,
            trace_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trace_id<S: Into<String>>(mut self, trace_id: S) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Partial, field-level job update
///
/// `None` leaves a field untouched. `append_logs` is appended to the stored
/// progress log; `metadata` replaces the stored metadata map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub job_status: Option<JobStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub current_step: Option<String>,
    pub append_logs: Vec<String>,
    pub metadata: Option<Map<String, Value>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.job_status = Some(status);
        self
    }

    pub fn output<S: Into<String>>(mut self, output: S) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn step<S: Into<String>>(mut self, step: S) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn log<S: Into<String>>(mut self, entry: S) -> Self {
        self.append_logs.push(entry.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Non-authoritative scheduler snapshot for health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub current_job_id: Option<JobId>,
    pub active_job_count: usize,
}

/// How a single execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The job left `queued` before it could be claimed
    Skipped,
}

/// Errors surfaced by the scheduler API
#[derive(Debug, thiserror::Error)]
pub enum JobSchedulingError {
    #[error("Job {id} not found")]
    JobNotFound { id: JobId },

    #[error("Job store operation failed: {source}")]
    Store {
        #[from]
        source: RepositoryError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(JobStatus::Queued, JobStatus::Running, true)]
    #[case(JobStatus::Queued, JobStatus::Cancelled, true)]
    #[case(JobStatus::Queued, JobStatus::Failed, true)]
    #[case(JobStatus::Queued, JobStatus::Completed, false)]
    #[case(JobStatus::Running, JobStatus::Completed, true)]
    #[case(JobStatus::Running, JobStatus::Failed, true)]
    #[case(JobStatus::Running, JobStatus::Cancelled, true)]
    #[case(JobStatus::Running, JobStatus::Queued, false)]
    #[case(JobStatus::Completed, JobStatus::Failed, false)]
    #[case(JobStatus::Cancelled, JobStatus::Running, false)]
    #[case(JobStatus::Failed, JobStatus::Queued, false)]
    fn test_state_machine_transitions(
        #[case] from: JobStatus,
        #[case] to: JobStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_status_round_trips_through_wire_name() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_update_appends_logs_and_replaces_metadata() {
        let mut job = GenerationJob::queued(JobId(1), NewGenerationJob::new("x"), Utc::now());
        job.progress.push_log("Job started");
        job.progress
            .metadata
            .insert("startedAt".to_string(), json!("earlier"));

        let mut metadata = Map::new();
        metadata.insert("outputLength".to_string(), json!(5));
        job.apply(
            &JobUpdate::new()
                .log("Generated 5 characters so far...")
                .metadata(metadata)
                .step("Generated 5 characters so far..."),
        );

        assert_eq!(job.progress.logs.len(), 2);
        assert_eq!(job.progress.logs[0], "Job started");
        assert_eq!(job.progress.metadata.get("outputLength"), Some(&json!(5)));
        assert!(job.progress.metadata.get("startedAt").is_none());
        assert_eq!(job.job_status, JobStatus::Queued);
    }

    #[test]
    fn test_liveness_falls_back_to_processed_then_created() {
        let created = Utc::now() - chrono::Duration::hours(2);
        let mut job = GenerationJob::queued(JobId(7), NewGenerationJob::new("x"), created);
        assert_eq!(job.liveness_at(), created);

        let processed = created + chrono::Duration::minutes(1);
        job.processed_at = Some(processed);
        assert_eq!(job.liveness_at(), processed);

        let beat = processed + chrono::Duration::minutes(1);
        job.last_heartbeat = Some(beat);
        assert_eq!(job.liveness_at(), beat);
    }

    #[test]
    fn test_job_id_parsing() {
        assert_eq!("42".parse::<JobId>().unwrap(), JobId(42));
        assert!("abc".parse::<JobId>().is_err());
        assert_eq!(JobId(9).to_string(), "9");
    }

    #[test]
    fn test_empty_update() {
        assert!(JobUpdate::new().is_empty());
        assert!(!JobUpdate::new().log("x").is_empty());
    }
}
