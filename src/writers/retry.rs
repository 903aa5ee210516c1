//! Retry utilities shared by the poller, the proof builder and the writers
//!
//! One policy for every network call: a fixed number of attempts with a fixed
//! delay between them. Only errors classified as retryable are re-run.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::RelayError;

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay between two consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Check if another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Classifies raw error messages for retry decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Height, transaction or account does not exist yet
    NotFound,
    /// Permanent failure - do not retry (rejected broadcast, contract error)
    Permanent,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("must be less than or equal to the current blockchain height")
        || error_lower.contains("could not find")
        || error_lower.contains("not found")
        || error_lower.contains("404")
    {
        return ErrorClass::NotFound;
    }

    if error_lower.contains("insufficient funds")
        || error_lower.contains("account sequence mismatch")
        || error_lower.contains("invalid signature")
        || error_lower.contains("exit code")
        || error_lower.contains("rejected")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}

/// Run `operation` under `policy`.
///
/// Returns the first success. A non-retryable error is returned immediately;
/// a retryable one is returned after exactly `policy.max_attempts` attempts
/// with `policy.delay` between each.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }
                warn!(
                    operation = operation_name,
                    attempt,
                    max = policy.max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Retrying after delay"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
