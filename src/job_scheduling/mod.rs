//! Background job scheduling for newsletter generation
//!
//! Queued jobs are picked up one at a time by [`JobQueueRunner`], streamed
//! through a [`GenerationEngine`](crate::engine::GenerationEngine), and
//! driven to `completed`, `failed` or `cancelled` in the [`JobStore`].
//!
//! # Components
//!
//! - **JobQueueRunner**: poll loop, stall loop, cancellation and status
//! - **JobExecutor**: one job's run, with heartbeat and progress writes
//! - **StalledJobDetector**: fails running jobs whose heartbeat went quiet
//! - **CancellationRegistry**: per-job tokens and the current-job marker
//! - **JobStore**: persistence port, with an in-memory implementation

pub mod cancellation;
pub mod job_executor;
pub mod job_queue_runner;
pub mod job_store;
pub mod memory_store;
pub mod stall_detector;
pub mod types;

pub use cancellation::{ActiveJobGuard, CancellationRegistry};
pub use job_executor::JobExecutor;
pub use job_queue_runner::JobQueueRunner;
pub use job_store::JobStore;
pub use memory_store::InMemoryJobStore;
pub use stall_detector::StalledJobDetector;
pub use types::*;
