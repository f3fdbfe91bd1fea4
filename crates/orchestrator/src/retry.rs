//! Retry policy for step invocations.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Bounded exponential backoff for failed step attempts.
///
/// The delay before retry N is `min(base_delay * 2^(N-1), max_delay)`, where N
/// is the attempt that just failed. `max_attempts` includes the first attempt,
/// so the default of 1 means "never retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` attempts with default delays.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Returns `true` if another attempt may follow the failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the failed `attempt` (1-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Wall-clock time at which the attempt after `attempt` may start.
    pub fn next_attempt_at(&self, attempt: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff_duration(attempt))
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy::attempts(10).with_base_delay(Duration::from_secs(1));

        assert_eq!(policy.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_duration(4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_at_max() {
        let policy = RetryPolicy::attempts(20)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60));

        // 1 * 2^9 = 512, capped at 60
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(60));
    }

    #[test]
    fn should_retry_until_budget_is_spent() {
        let policy = RetryPolicy::attempts(3);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::attempts(0).max_attempts, 1);
    }
}
