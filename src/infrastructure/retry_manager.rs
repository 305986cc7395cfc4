//! Bounded retry with exponential backoff
//!
//! The controller re-runs an operation while its error is retryable, up to
//! `max_retries` extra attempts. Delay before retry `k` (1-based) is
//! `base * 2^(k-1)`, capped at `max_delay`, plus jitter in `[0, base)`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::TerminalError;
use crate::domain::errors::Retryable;

/// Retry policy settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        let exponential = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let base_ms = self.base_delay.as_millis() as u64;
        if self.jitter && base_ms > 0 {
            exponential + Duration::from_millis(fastrand::u64(0..base_ms))
        } else {
            exponential
        }
    }
}

/// Runs operations under a `RetryPolicy`
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails terminally or retries run out.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, operation: F) -> Result<T, TerminalError<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(label, None, operation).await
    }

    /// Like `execute`, but a stop signal ends the backoff wait early with the last error
    pub async fn execute_until<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, TerminalError<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(label, Some(cancel), operation).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T, TerminalError<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let last_error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !last_error.is_retryable() || attempt >= max_attempts {
                if last_error.is_retryable() {
                    warn!("❌ {} gave up after {} attempts: {}", label, attempt, last_error);
                }
                return Err(TerminalError {
                    last_error,
                    attempts: attempt,
                });
            }

            let delay = self.policy.calculate_delay(attempt);
            warn!(
                "🔄 {} attempt {}/{} failed: {} (retrying in {:?})",
                label, attempt, max_attempts, last_error, delay
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => {
                            debug!("🛑 {} retry abandoned: stop requested", label);
                            return Err(TerminalError { last_error, attempts: attempt });
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}
