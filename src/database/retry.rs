//! Retry for transient database failures
//!
//! SQLite answers a writer that loses a lock race with `database is locked`
//! instead of waiting. Store writes go through [`with_retry`] so such a
//! collision costs a short backoff rather than a failed cancel or a job
//! stuck in `running`.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{RepositoryError, RepositoryResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread concurrent retriers by up to a quarter of the delay
    pub jitter: bool,
}

impl RetryConfig {
    /// Policy used for every job store write
    pub fn for_writes() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Run `operation` until it succeeds, fails for good, or runs out of attempts
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
    operation_name: &str,
) -> RepositoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RepositoryResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("'{}' succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err) if is_retryable(&err) && attempt < config.max_attempts => {
                let delay = backoff(config, attempt);
                warn!(
                    "'{}' hit a transient error on attempt {}/{}, retrying in {:?}: {}",
                    operation_name, attempt, config.max_attempts, delay, err
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    warn!(
                        "'{}' failed after {} attempt(s): {}",
                        operation_name, attempt, err
                    );
                }
                return Err(err);
            }
        }
    }
}

/// Lock contention and pool exhaustion are worth another try
fn is_retryable(error: &RepositoryError) -> bool {
    match error {
        RepositoryError::ConnectionFailed { .. } => true,
        RepositoryError::Database(db_err) => match db_err {
            sea_orm::DbErr::ConnectionAcquire(_) | sea_orm::DbErr::Conn(_) => true,
            other => {
                let message = other.to_string().to_lowercase();
                message.contains("database is locked")
                    || message.contains("database is busy")
                    || message.contains("database table is locked")
            }
        },
        _ => false,
    }
}

fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let base_ms = config.initial_delay.as_millis() as f64 * config.backoff_multiplier.powi(exponent);
    let delay_ms = base_ms.min(config.max_delay.as_millis() as f64) as u64;

    if config.jitter && delay_ms >= 4 {
        Duration::from_millis(delay_ms + clock_jitter(delay_ms / 4))
    } else {
        Duration::from_millis(delay_ms)
    }
}

/// Cheap 0..=max spread taken from the clock's sub-second nanos
fn clock_jitter(max: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % (max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DbErr, RuntimeErr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn locked() -> RepositoryError {
        RepositoryError::Database(DbErr::Exec(RuntimeErr::Internal(
            "error returned from database: (code: 5) database is locked".to_string(),
        )))
    }

    #[tokio::test]
    async fn test_locked_database_is_retried_until_it_frees_up() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            &quick(),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(locked())
                    } else {
                        Ok("written")
                    }
                }
            },
            "update job",
        )
        .await;

        assert_eq!(result.unwrap(), "written");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: RepositoryResult<()> = with_retry(
            &quick(),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(locked())
                }
            },
            "update job",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: RepositoryResult<()> = with_retry(
            &quick(),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RepositoryError::InvalidValue {
                        field: "job_status".to_string(),
                        value: "paused".to_string(),
                    })
                }
            },
            "update job",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff(&config, 4), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..RetryConfig::for_writes()
        };
        let delay = backoff(&config, 2);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }
}
