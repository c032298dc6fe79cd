//! Background job queue for streaming newsletter generation
//!
//! Jobs are enqueued into a [`JobStore`](job_scheduling::JobStore), picked up
//! one at a time by the [`JobQueueRunner`](job_scheduling::JobQueueRunner)
//! in priority order, and streamed through a
//! [`GenerationEngine`](engine::GenerationEngine) with heartbeats, periodic
//! progress, cancellation and stall recovery.

pub mod config;
pub mod database;
pub mod engine;
pub mod entities;
pub mod errors;
pub mod job_scheduling;

pub use config::Config;
pub use errors::{AppError, AppResult};
