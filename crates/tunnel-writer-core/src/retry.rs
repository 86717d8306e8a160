//! Retry with exponential backoff for setup-phase remote calls.
//!
//! Only errors the injected classifier accepts are retried; anything else is
//! returned on the spot. Backoff sleeps block the calling task, which is fine
//! because retries only happen before task fan-out.

use crate::error::ServiceError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one
    pub base_delay: Duration,
    /// Cap on a single delay
    pub max_delay: Duration,
    /// Upper bound on total elapsed time across attempts
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            deadline: None,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Final failure of a retried operation.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Attempts actually made
    pub attempts: u32,
    /// Error of the last attempt
    pub last: E,
}

/// Default classifier: retry only whitelisted transport failures.
pub fn transient(err: &ServiceError) -> bool {
    err.is_transient()
}

/// Classifier that retries everything.
pub fn retry_all<E>(_: &E) -> bool {
    true
}

/// Run `f` until it succeeds, the classifier rejects an error, attempts run
/// out or the next backoff would cross the deadline.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    op_name: &str,
    mut f: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(op = op_name, attempts = attempt + 1, "Succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let attempts = attempt + 1;
        if !classify(&err) {
            debug!(op = op_name, error = %err, "Non-retriable failure");
            return Err(RetryError {
                attempts,
                last: err,
            });
        }
        if attempts >= max_attempts {
            warn!(op = op_name, attempts, error = %err, "Retries exhausted");
            return Err(RetryError {
                attempts,
                last: err,
            });
        }

        let delay = policy.delay_for(attempt);
        if let Some(deadline) = policy.deadline {
            if started.elapsed() + delay > deadline {
                warn!(
                    op = op_name,
                    attempts,
                    deadline_ms = deadline.as_millis() as u64,
                    error = %err,
                    "Retry deadline reached"
                );
                return Err(RetryError {
                    attempts,
                    last: err,
                });
            }
        }

        warn!(
            op = op_name,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
