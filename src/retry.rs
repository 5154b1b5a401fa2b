//! Bounded retry with exponential backoff.
//!
//! Only [`SyncError::Transient`] failures are retried. The wait before
//! retry `n` (zero-based) is `backoff * 2^n`, so with the defaults
//! (3 retries, 2s) an operation makes 4 attempts and waits at most
//! 2 + 4 + 8 = 14 seconds in total. Once the budget is spent the last
//! error is escalated to [`SyncError::Terminal`].

use std::future::Future;
use std::time::Duration;

use ragsync_core::Result;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs_f64(config.backoff_seconds),
        )
    }

    /// Wait before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.backoff.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Sum of every wait in the series; the worst-case time spent sleeping.
    pub fn total_wait(&self) -> Duration {
        (0..self.max_retries).fold(Duration::ZERO, |acc, n| {
            acc.saturating_add(self.delay_for(n))
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// A named async action run under a [`RetryPolicy`].
///
/// ```rust,no_run
/// # use ragsync::retry::{RetryPolicy, RetryableOperation};
/// # async fn demo(store: &dyn ragsync_core::vector::VectorStore) -> ragsync_core::Result<()> {
/// RetryableOperation::new("vector flush", RetryPolicy::default())
///     .run(|| store.flush("collection_acme"))
///     .await
/// # }
/// ```
pub struct RetryableOperation<'a> {
    name: &'a str,
    policy: RetryPolicy,
}

impl<'a> RetryableOperation<'a> {
    pub fn new(name: &'a str, policy: RetryPolicy) -> Self {
        Self { name, policy }
    }

    /// Invoke `action` until it succeeds, fails non-transiently, or the
    /// retry budget runs out.
    pub async fn run<T, F, Fut>(&self, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let wait = self.policy.delay_for(attempt);
                    tracing::warn!(
                        operation = self.name,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_retries + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::error!(
                        operation = self.name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(err.exhausted(attempt + 1));
                }
                Err(err) => return Err(err),
            }
        }
    }
}
