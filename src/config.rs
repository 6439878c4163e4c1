//! Environment-driven configuration for the runtime and the guardian.

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Runtime process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub journal_path: String,
    pub liveness_dir: String,
    pub component_id: String,
    pub sqlite_path: String,
    pub kill_file: String,
    pub heartbeat_secs: u64,
    pub persist_every_secs: u64,
    /// Commands admitted per type within one rate window.
    pub rate_limit_per_min: u32,
    /// Consecutive handler failures before the authorize circuit opens.
    pub failure_threshold: u32,
    /// Timeout for a single handler side effect.
    pub handler_timeout_ms: u64,
    /// Capacity of the submission channel feeding the sequencer.
    pub bus_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            journal_path: env_str("JOURNAL_PATH", "./sentinel.journal"),
            liveness_dir: env_str("LIVENESS_DIR", "./liveness"),
            component_id: env_str("COMPONENT_ID", "runtime"),
            sqlite_path: env_str("SQLITE_PATH", "./sentinel.sqlite"),
            kill_file: env_str("KILL_FILE", "/tmp/STOP"),
            heartbeat_secs: env_or("HEARTBEAT_SECS", 5),
            persist_every_secs: env_or("PERSIST_SECS", 300),
            rate_limit_per_min: env_or("RATE_LIMIT_PER_MIN", 60),
            failure_threshold: env_or("FAILURE_THRESHOLD", 5),
            handler_timeout_ms: env_or("HANDLER_TIMEOUT_MS", 10_000),
            bus_channel_capacity: env_or("BUS_CHANNEL_CAP", 256),
        }
    }
}

/// Guardian supervisor configuration.
#[derive(Clone, Debug)]
pub struct GuardianConfig {
    pub liveness_dir: String,
    pub journal_path: String,
    /// Command line used to (re)start the supervised runtime.
    pub runtime_cmd: String,
    pub stale_threshold_sec: u64,
    pub critical_multiplier: u64,
    pub watchdog_poll_interval_sec: u64,
    pub max_restart_count: u32,
    pub backoff_seconds: u64,
    pub alert_rate_limit_minutes: u64,
    /// Sustained-OK window after which the restart counter resets.
    pub healthy_reset_sec: u64,
}

impl GuardianConfig {
    pub fn from_env() -> Self {
        Self {
            liveness_dir: env_str("LIVENESS_DIR", "./liveness"),
            journal_path: env_str("JOURNAL_PATH", "./sentinel.journal"),
            runtime_cmd: env_str("RUNTIME_CMD", "./sentinelfx"),
            stale_threshold_sec: env_or("STALE_THRESHOLD_SEC", 60),
            critical_multiplier: env_or("CRITICAL_MULTIPLIER", 3),
            watchdog_poll_interval_sec: env_or("WATCHDOG_POLL_SEC", 10),
            max_restart_count: env_or("MAX_RESTART_COUNT", 3),
            backoff_seconds: env_or("BACKOFF_SECONDS", 15),
            alert_rate_limit_minutes: env_or("ALERT_RATE_LIMIT_MIN", 5),
            healthy_reset_sec: env_or("HEALTHY_RESET_SEC", 600),
        }
    }
}
