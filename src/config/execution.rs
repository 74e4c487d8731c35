//! Order execution configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Order execution settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on one exchange call, retries excluded (default: 15s).
    #[serde(default, with = "duration")]
    pub timeout: Duration,
    /// Retry behavior for transient failures.
    pub retry: Option<RetryConfig>,
}

impl ExecutionConfig {
    pub fn attempt_timeout(&self) -> Duration {
        duration::or_default(self.timeout, DEFAULT_ATTEMPT_TIMEOUT)
    }

    /// Resolves the retry section into a concrete policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = self.retry.as_ref();
        RetryPolicy {
            max_attempts: retry
                .and_then(|r| r.max_attempts)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_delay: duration::or_default(
                retry.map(|r| r.initial_delay).unwrap_or_default(),
                DEFAULT_INITIAL_DELAY,
            ),
            max_delay: duration::or_default(
                retry.map(|r| r.max_delay).unwrap_or_default(),
                DEFAULT_MAX_DELAY,
            ),
            multiplier: retry
                .and_then(|r| r.multiplier)
                .filter(|m| *m >= 1.0)
                .unwrap_or(DEFAULT_MULTIPLIER),
        }
    }
}

/// Retry settings for failed operations.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    #[serde(default, with = "duration")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(default, with = "duration")]
    pub max_delay: Duration,
    /// Factor by which delay increases after each retry.
    pub multiplier: Option<f64>,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}
