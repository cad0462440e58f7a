//! Bounded retries with a fixed delay and cooperative cancellation.
//!
//! Readiness probes and status polls run through [`retry`]. The caller's
//! [`CancellationToken`] is the deadline: once it fires, the loop stops
//! between attempts and reports [`RetryError::Timeout`] together with the
//! last recorded failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default number of attempts before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 100;

/// Classifies failures that are worth repeating.
pub trait Retryable {
    /// Returns `false` when repeating the operation cannot succeed.
    fn is_retryable(&self) -> bool;
}

/// Delay and attempt budget applied by [`retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Pause between consecutive attempts.
    pub delay: Duration,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy with the given delay and attempt budget.
    #[must_use]
    pub const fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Returns a copy of the policy with a different delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY, DEFAULT_RETRY_ATTEMPTS)
    }
}

/// Failure modes of [`retry`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The cancellation token fired before the operation succeeded.
    #[error("timed out after {attempts} attempt(s){}", describe_last(.last))]
    Timeout {
        /// Attempts made before cancellation.
        attempts: u32,
        /// Most recent failure, if any attempt completed.
        last: Option<E>,
    },
    /// The attempt budget ran out.
    #[error("gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Failure returned by the final attempt.
        #[source]
        source: E,
    },
    /// The operation reported a failure that cannot be retried.
    #[error("{0}")]
    Aborted(#[source] E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns the most recent failure reported by the operation.
    #[must_use]
    pub const fn last_error(&self) -> Option<&E> {
        match self {
            Self::Timeout { last, .. } => last.as_ref(),
            Self::Exhausted { source, .. } | Self::Aborted(source) => Some(source),
        }
    }
}

fn describe_last<E: fmt::Display>(last: &Option<E>) -> String {
    last.as_ref()
        .map_or_else(String::new, |err| format!("; last error: {err}"))
}

/// Runs `operation` until it succeeds, the budget is spent, a non-retryable
/// error is returned or `cancel` fires.
///
/// # Errors
///
/// Returns [`RetryError::Timeout`] on cancellation, [`RetryError::Exhausted`]
/// once `policy.max_attempts` attempts have failed, and
/// [`RetryError::Aborted`] for failures whose [`Retryable::is_retryable`]
/// returns `false`.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0_u32;
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Timeout { attempts, last });
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Timeout { attempts, last }),
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(RetryError::Aborted(err)),
            Err(err) if attempts >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts,
                    source: err,
                });
            }
            Err(err) => {
                debug!(attempt = attempts, error = %err, "attempt failed; retrying");
                last = Some(err);
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Timeout { attempts, last }),
            () = sleep(policy.delay) => {}
        }
    }
}

/// Derives a token that fires after `timeout` or when `parent` is cancelled.
///
/// Must be called from within a Tokio runtime. Cancelling the returned token
/// stops the timer without affecting `parent`.
#[must_use]
pub fn cancel_after(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = timer.cancelled() => {}
            () = sleep(timeout) => timer.cancel(),
        }
    });
    child
}
