//! Worker configuration loaded from environment variables.

use std::time::Duration;

use orchestrator::ResumeWorkerConfig;

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store and queue when unset
/// - `RESUME_POLL_INTERVAL_MS`: resume queue poll interval (default: `500`)
/// - `RESUME_LOCK_SECS`: how long a claimed resume message stays locked (default: `30`)
/// - `PURGE_INTERVAL_SECS`: how often expired transactions are purged (default: `3600`)
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub lock_duration: Duration,
    pub purge_interval: Duration,
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            poll_interval: number("RESUME_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            lock_duration: number("RESUME_LOCK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_duration),
            purge_interval: number("PURGE_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.purge_interval),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resume_worker(&self) -> ResumeWorkerConfig {
        ResumeWorkerConfig {
            poll_interval: self.poll_interval,
            lock_duration: self.lock_duration,
            ..ResumeWorkerConfig::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(30),
            purge_interval: Duration::from_secs(3600),
        }
    }
}
