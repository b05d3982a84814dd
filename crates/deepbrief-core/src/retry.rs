//! Exponential-backoff retry around a single backend call.

use std::future::Future;
use std::time::Duration;

use crate::error::BackendError;

/// Backoff schedule for one call site. Each call site owns its own
/// attempt budget; there is no cross-call circuit breaking.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`, no jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(u32::MAX as usize) as u32))
    }
}

/// Run `operation`, retrying transient failures per `policy`. The last
/// error is propagated once the attempt budget is spent. Dropping the
/// returned future cancels the in-flight call and any pending backoff.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.max_attempts && err.is_retryable() => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    error = %err,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
