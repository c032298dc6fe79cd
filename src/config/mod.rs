//! Application configuration
//!
//! Loaded from a TOML file and overridden by `NEWSLETTER_QUEUE_*` environment
//! variables, with nested keys separated by `__`
//! (e.g. `NEWSLETTER_QUEUE_JOB_QUEUE__POLL_INTERVAL=2s`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub mod defaults;
pub mod duration_serde;

use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub job_queue: JobQueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: Some(DEFAULT_MAX_CONNECTIONS),
        }
    }
}

/// Timers driving the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// How often the poll loop looks for queued work
    #[serde(with = "duration_serde::duration", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Liveness signal cadence while a job runs
    #[serde(with = "duration_serde::duration", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Minimum spacing between persisted progress updates
    #[serde(
        with = "duration_serde::duration",
        default = "default_progress_update_interval"
    )]
    pub progress_update_interval: Duration,

    #[serde(
        with = "duration_serde::duration",
        default = "default_stall_check_interval"
    )]
    pub stall_check_interval: Duration,

    /// Heartbeat age after which a running job is force-failed
    #[serde(with = "duration_serde::duration", default = "default_stall_timeout")]
    pub stall_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS)
}
fn default_progress_update_interval() -> Duration {
    Duration::from_secs(DEFAULT_PROGRESS_UPDATE_INTERVAL_SECS)
}
fn default_stall_check_interval() -> Duration {
    Duration::from_secs(DEFAULT_STALL_CHECK_INTERVAL_SECS)
}
fn default_stall_timeout() -> Duration {
    Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS)
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            progress_update_interval: default_progress_update_interval(),
            stall_check_interval: default_stall_check_interval(),
            stall_timeout: default_stall_timeout(),
        }
    }
}

impl JobQueueConfig {
    /// Reject timer settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), String> {
        let intervals = [
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("progress_update_interval", self.progress_update_interval),
            ("stall_check_interval", self.stall_check_interval),
            ("stall_timeout", self.stall_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(format!("job_queue.{name} must be greater than zero"));
        }

        // A live job must get several heartbeats in before it can look stalled
        if self.stall_timeout <= self.heartbeat_interval {
            return Err(format!(
                "job_queue.stall_timeout ({}) must be larger than job_queue.heartbeat_interval ({})",
                humantime::format_duration(self.stall_timeout),
                humantime::format_duration(self.heartbeat_interval)
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Streaming text endpoint the HTTP engine POSTs prompts to
    pub endpoint: String,

    /// How long to wait for response headers; the body is governed by `idle_timeout`
    #[serde(
        with = "duration_serde::duration",
        default = "default_engine_request_timeout"
    )]
    pub request_timeout: Duration,

    #[serde(
        with = "duration_serde::duration",
        default = "default_engine_connect_timeout"
    )]
    pub connect_timeout: Duration,

    /// Longest silence tolerated between response chunks
    #[serde(
        default,
        with = "duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<Duration>,

    /// Optional bearer token sent with each request
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_engine_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ENGINE_REQUEST_TIMEOUT_SECS)
}
fn default_engine_connect_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ENGINE_CONNECT_TIMEOUT_SECS)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENGINE_ENDPOINT.to_string(),
            request_timeout: default_engine_request_timeout(),
            connect_timeout: default_engine_connect_timeout(),
            idle_timeout: None,
            api_key: None,
        }
    }
}

impl Config {
    /// Layered provider: built-in defaults, then the TOML file, then the environment
    pub fn figment<P: AsRef<Path>>(config_file: P) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> AppResult<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Load configuration; a missing file falls back to defaults plus environment
    pub fn load_from_file<P: AsRef<Path>>(config_file: P) -> AppResult<Self> {
        let path = config_file.as_ref();
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
        } else {
            debug!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
        }
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(AppError::configuration("database.url must not be empty"));
        }
        if self.database.max_connections == Some(0) {
            return Err(AppError::configuration(
                "database.max_connections must be greater than zero",
            ));
        }
        self.job_queue.validate().map_err(AppError::configuration)?;
        if self.engine.endpoint.trim().is_empty() {
            return Err(AppError::configuration("engine.endpoint must not be empty"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| AppError::internal(e.to_string()))
    }
}
