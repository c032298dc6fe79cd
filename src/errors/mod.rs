//! Centralized error handling for the newsletter queue
//!
//! # Error Categories
//!
//! - **Database Errors**: SeaORM operations, migrations, connection issues
//! - **Repository Errors**: job store failures
//! - **Job Scheduling Errors**: unknown jobs, store failures surfaced by the scheduler
//! - **Configuration Errors**: invalid or unreadable configuration

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Repository Results
pub type RepositoryResult<T> = Result<T, RepositoryError>;
