use std::time::Duration;

/// Runtime knobs, read from `SKERRY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub request_timeout: Duration,
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
    pub batch_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            watch_backoff_base: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
            batch_window: Duration::from_millis(8),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            request_timeout: env_u64("SKERRY_REQUEST_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.request_timeout),
            watch_backoff_base: env_u64("SKERRY_WATCH_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.watch_backoff_base),
            watch_backoff_max: env_u64("SKERRY_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            batch_window: env_u64("SKERRY_BATCH_WINDOW_MS").map(Duration::from_millis).unwrap_or(d.batch_window).max(Duration::from_millis(1)),
        }
    }
}
