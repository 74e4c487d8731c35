//! Bounded retry with exponential backoff for exchange calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::exchanges::ExchangeError;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Non-transient failure, surfaced on the attempt it happened.
    Fatal(ExchangeError),
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last: ExchangeError },
}

impl RetryError {
    pub fn into_inner(self) -> ExchangeError {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the policy runs out.
/// Each attempt is bounded by `attempt_timeout`; an elapsed attempt counts
/// as a transient timeout.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match tokio::time::timeout(attempt_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => ExchangeError::Timeout(format!(
                "{} exceeded {:?}",
                operation, attempt_timeout
            )),
        };

        if !err.is_transient() {
            return Err(RetryError::Fatal(err));
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted { attempts: attempt, last: err });
        }

        let delay = policy.delay_after(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient exchange error, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
