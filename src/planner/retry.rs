//! Retry policy for transient remote failures.
//!
//! Delays grow exponentially from `initial_backoff`, capped at
//! `max_backoff`, with full jitter. A server `retry_after` hint raises the
//! delay. Retrying stops at `max_attempts` or once the next delay would
//! overrun `total_budget`.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::RemoteError;

/// Default maximum attempts per remote call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first backoff delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default backoff cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default wall-clock budget for one call including retries.
pub const DEFAULT_TOTAL_BUDGET: Duration = Duration::from_secs(300);

/// Exponent cap; the backoff cap is reached long before this.
const MAX_EXPONENT: u32 = 32;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Wall-clock budget across all attempts.
    pub total_budget: Duration,
    /// Randomize each delay in `[0, delay]`.
    pub jitter: bool,
}

/// Result of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result.
    pub result: Result<T, RemoteError>,
    /// Attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 2.0,
            total_budget: DEFAULT_TOTAL_BUDGET,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial and maximum backoff.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the total budget.
    #[must_use]
    pub const fn with_total_budget(mut self, total_budget: Duration) -> Self {
        self.total_budget = total_budget;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(MAX_EXPONENT)).unwrap_or(0);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        let capped = if scaled >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        };

        let base = if self.jitter {
            capped.mul_f64(fastrand::f64())
        } else {
            capped
        };

        retry_after.map_or(base, |hint| base.max(hint))
    }

    /// Runs `operation` until it succeeds, fails permanently or the policy
    /// is exhausted. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            let retry_after = match &error {
                RemoteError::Transient { retry_after, .. } => *retry_after,
                _ => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            };

            if attempt >= max_attempts {
                warn!("{label}: giving up after {attempt} attempt(s): {error}");
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt, retry_after);
            if started.elapsed() + delay > self.total_budget {
                warn!("{label}: retry budget of {:?} exhausted: {error}", self.total_budget);
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            debug!("{label}: attempt {attempt} failed ({error}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}
