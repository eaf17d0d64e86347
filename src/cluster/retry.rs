//! Retry-on-conflict combinator for read-modify-write loops
//!
//! Callers pass a closure that re-reads the object, applies its delta, and
//! writes it back. Conflicts are retried with capped exponential backoff;
//! any other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Errors that can signal an optimistic-concurrency conflict
pub trait ConflictError {
    fn is_conflict(&self) -> bool;
}

/// Backoff policy for conflict retries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap on the delay between retries
    pub max_backoff: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Total attempts allowed; `None` retries conflicts forever
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Conflict retries without an attempt bound (node labels)
    pub fn unbounded() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 5.0,
            max_attempts: None,
        }
    }

    /// Conflict retries bounded to a few attempts (status writes)
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 1.0,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether `attempts` attempts use up the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// policy's attempt budget is spent.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: ConflictError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                attempts = attempts.saturating_add(1);
                if policy.is_exhausted(attempts) {
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempts - 1);
                debug!(attempts, ?delay, "Write conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
