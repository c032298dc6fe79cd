/// Configuration default values
///
/// All defaults live here so they can be changed in one place.
// Database defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./newsletter-queue.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

// Job queue defaults (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PROGRESS_UPDATE_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_STALL_CHECK_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 15 * 60;

// Generation engine defaults
pub const DEFAULT_ENGINE_ENDPOINT: &str = "http://127.0.0.1:8787/v1/generate";
pub const DEFAULT_ENGINE_REQUEST_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_ENGINE_CONNECT_TIMEOUT_SECS: u64 = 10;

// Environment overrides
pub const ENV_PREFIX: &str = "NEWSLETTER_QUEUE_";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
