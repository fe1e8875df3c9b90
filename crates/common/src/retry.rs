//! Resilient-call policy: bounded retries with exponential backoff.
//!
//! Every store, cache and queue call in the pipeline goes through a
//! [`RetryPolicy`]. Sender delivery calls never do: one delivery attempt per
//! message, since a retry cannot know whether the remote channel already
//! accepted it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default number of attempts (including the first call).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default multiplier applied to the delay after each failed attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Cap on any single retry delay, however large the multiplier.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Factor the delay is multiplied by after every failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// A policy that calls the operation once and never sleeps.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after the given failed attempt (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        scale(self.initial_delay, self.backoff_multiplier.max(0.0).powi(exponent))
    }

    /// Run `op` until it succeeds or the attempts are exhausted, returning the
    /// last error. Cancellation is not observed.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(None, op_name, op).await
    }

    /// Like [`RetryPolicy::run`], but stops at the next attempt boundary once
    /// `cancel` fires. A call already in progress is never interrupted.
    pub async fn run_until<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op_name: &str,
        op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(Some(cancel), op_name, op).await
    }

    async fn execute<T, E, F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        op_name: &str,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.attempts();
        let mut delay = self.initial_delay;
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            tracing::warn!(
                op = op_name,
                attempt,
                max_attempts,
                error = %err,
                "Call failed"
            );

            if attempt >= max_attempts {
                return Err(err);
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!(op = op_name, attempt, "Retry abandoned on cancellation");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            delay = scale(delay, self.backoff_multiplier.max(0.0));
            attempt += 1;
        }
    }
}

/// `delay * factor`, saturating at [`MAX_RETRY_DELAY`]. Overflowing or
/// non-finite products saturate too.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}
