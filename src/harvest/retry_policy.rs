//! Retry policy for failed fetches and manifest expansions.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::HarvestSettings;
use crate::sources::FetchError;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before permanent failure.
    pub max_retries: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
}

/// What to do with a work unit after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to PENDING, eligible again at this Unix millisecond timestamp.
    RetryAt(i64),
    /// Record a permanent failure.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(settings: &HarvestSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Backoff before the retry that follows failure number `failures`
    /// (1 for the first failure).
    ///
    /// `initial_backoff * multiplier^(failures - 1)`, capped at
    /// `max_backoff_secs`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(backoff.min(self.max_backoff_secs as f64).max(0.0))
    }

    /// Decide the fate of a unit that just failed for the `failures`-th time.
    ///
    /// Permanent errors are never retried. A rate-limit response is retried
    /// no earlier than the delay the source asked for.
    pub fn decide(&self, error: &FetchError, failures: u32, now_millis: i64) -> RetryDecision {
        if !error.is_retryable() || failures > self.max_retries {
            return RetryDecision::GiveUp;
        }
        let mut delay = self.backoff(failures);
        if let FetchError::RateLimited {
            retry_after: Some(retry_after),
        } = error
        {
            delay = delay.max(*retry_after);
        }
        RetryDecision::RetryAt(now_millis + delay.as_millis() as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&HarvestSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff_secs: 60,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_default_matches_settings() {
        let policy = RetryPolicy::default();
        let settings = HarvestSettings::default();
        assert_eq!(policy.max_retries, settings.max_retries);
        assert_eq!(policy.initial_backoff_secs, settings.initial_backoff_secs);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(4), Duration::from_secs(300));
        assert_eq!(policy.backoff(40), Duration::from_secs(300));
    }

    #[test]
    fn test_transient_failures_retry_until_ceiling() {
        let policy = policy();
        let err = FetchError::Transient("connection reset".into());
        assert_eq!(policy.decide(&err, 1, 1_000), RetryDecision::RetryAt(61_000));
        assert_eq!(policy.decide(&err, 3, 1_000), RetryDecision::RetryAt(241_000));
        assert_eq!(policy.decide(&err, 4, 1_000), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_failure_never_retries() {
        let err = FetchError::Permanent("404 Not Found".into());
        assert_eq!(policy().decide(&err, 1, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let policy = policy();
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(policy.decide(&err, 1, 0), RetryDecision::RetryAt(600_000));

        let err = FetchError::RateLimited { retry_after: None };
        assert_eq!(policy.decide(&err, 1, 0), RetryDecision::RetryAt(60_000));
    }

    #[test]
    fn test_zero_backoff_is_immediate() {
        let policy = RetryPolicy {
            initial_backoff_secs: 0,
            ..policy()
        };
        let err = FetchError::Transient("timeout".into());
        assert_eq!(policy.decide(&err, 2, 5), RetryDecision::RetryAt(5));
    }
}
