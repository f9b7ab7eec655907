//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Supervisor and worker configuration.
///
/// Every field has a default suitable for local use; `from_env()` applies
/// `OFFLOAD_*` environment overrides on top.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the shared database file.
    pub db_path: PathBuf,
    /// Supervisor poll interval.
    pub poll_interval: Duration,
    /// Age after which a claim with no progress is considered orphaned.
    pub claim_timeout: Duration,
    /// Wall-clock deadline for a launched worker before forced termination.
    pub task_timeout: Duration,
    /// Maximum number of concurrently running workers.
    pub max_workers: usize,
    /// Default retry budget for tasks that don't specify one.
    pub default_max_retries: i32,
    /// Base delay for the exponential retry backoff.
    pub retry_backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub retry_backoff_max: Duration,
    /// Whether a terminal upstream failure fails dependent tasks.
    /// Off by default: dependents stay blocked instead.
    pub cascade_failures: bool,
    /// Path to the worker binary the supervisor spawns.
    pub worker_bin: PathBuf,
    /// Messages drained to the handler per poll cycle.
    pub message_batch: usize,
    /// Notification deliveries attempted per poll cycle.
    pub notify_batch: usize,
    /// Terminal rows older than this many days are archived.
    pub retention_days: u32,
    /// How often the archival sweep runs.
    pub archive_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/offload.db"),
            poll_interval: Duration::from_secs(2),
            claim_timeout: Duration::from_secs(300), // 5 minutes
            task_timeout: Duration::from_secs(600),  // 10 minutes
            max_workers: 4,
            default_max_retries: 3,
            retry_backoff_base: Duration::from_secs(30),
            retry_backoff_max: Duration::from_secs(3600), // 1 hour
            cascade_failures: false,
            worker_bin: PathBuf::from("offload-worker"),
            message_batch: 16,
            notify_batch: 16,
            retention_days: 30,
            archive_interval: Duration::from_secs(6 * 3600),
        }
    }
}

impl Config {
    /// Build a config from defaults plus `OFFLOAD_*` environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("OFFLOAD_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(ms) = env_u64("OFFLOAD_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("OFFLOAD_CLAIM_TIMEOUT_SECS")? {
            config.claim_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("OFFLOAD_TASK_TIMEOUT_SECS")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("OFFLOAD_MAX_WORKERS")? {
            config.max_workers = n as usize;
        }
        if let Some(n) = env_u64("OFFLOAD_MAX_RETRIES")? {
            config.default_max_retries = n as i32;
        }
        if let Some(secs) = env_u64("OFFLOAD_RETRY_BACKOFF_SECS")? {
            config.retry_backoff_base = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("OFFLOAD_CASCADE_FAILURES") {
            config.cascade_failures = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(path) = std::env::var("OFFLOAD_WORKER_BIN") {
            config.worker_bin = PathBuf::from(path);
        }
        if let Some(n) = env_u64("OFFLOAD_RETENTION_DAYS")? {
            config.retention_days = n as u32;
        }

        Ok(config)
    }

    /// Backoff delay before a failed task's next attempt.
    ///
    /// Exponential in the retry count, jittered by up to half the base so
    /// retries from a batch failure don't become claimable in lockstep.
    pub fn backoff_for(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 16) as u32;
        let base = self
            .retry_backoff_base
            .saturating_mul(2u32.saturating_pow(exp));
        let capped = base.min(self.retry_backoff_max);
        let jitter_ceil = (self.retry_backoff_base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceil);
        capped + Duration::from_millis(jitter)
    }
}

/// Read an optional unsigned integer environment variable.
fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
