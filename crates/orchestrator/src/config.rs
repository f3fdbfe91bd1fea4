//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Engine-wide defaults applied to steps that do not override them.
///
/// Reads from environment variables:
/// - `WORKFLOW_MAX_ATTEMPTS`: attempts per step, including the first (default: `1`)
/// - `WORKFLOW_RETRY_BASE_DELAY_MS`: first backoff delay (default: `100`)
/// - `WORKFLOW_RETRY_MAX_DELAY_MS`: backoff cap (default: `30000`)
/// - `WORKFLOW_STEP_TIMEOUT_MS`: per-attempt timeout (default: none)
/// - `WORKFLOW_RETENTION_SECS`: how long terminal transactions are kept (default: forever)
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub step_timeout: Option<Duration>,
    pub retention: Option<Duration>,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = RetryPolicy::default();

        Self {
            retry: RetryPolicy {
                max_attempts: number("WORKFLOW_MAX_ATTEMPTS")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(defaults.max_attempts)
                    .max(1),
                base_delay: number("WORKFLOW_RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: number("WORKFLOW_RETRY_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
            },
            step_timeout: number("WORKFLOW_STEP_TIMEOUT_MS").map(Duration::from_millis),
            retention: number("WORKFLOW_RETENTION_SECS").map(Duration::from_secs),
        }
    }
}
