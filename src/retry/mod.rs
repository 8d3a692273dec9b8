//! RetryKit: cancellable delays, exponential-backoff retry, timeouts and a
//! restartable periodic scheduler.
//!
//! Every operation takes an explicit [`CancellationToken`]. Cancellation is
//! reported as its own outcome ([`Error::Cancelled`] / [`RetryError::Cancelled`])
//! so callers can tell "I stopped this" apart from "this failed".

pub mod scheduler;

pub use scheduler::{create_scheduler, Scheduler, SchedulerOptions};

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::Error;

/// Wait for `duration`, or fail with [`Error::Cancelled`] if the token fires first
pub async fn delay(duration: Duration, token: &CancellationToken) -> Result<(), Error> {
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Delay before attempt `attempt + 1`: `min(base * factor^(attempt - 1), max)`.
///
/// Attempt numbers are 1-based; attempt 0 yields no delay. No jitter is added.
pub fn backoff_delay(base: Duration, factor: f64, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let millis = base.as_millis() as f64 * factor.powi(exponent);
    let capped = millis.min(max.as_millis() as f64).max(0.0);

    Duration::from_millis(capped as u64)
}

/// Parameters for [`retry`]
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub token: CancellationToken,
}

impl RetryOptions {
    /// Options from a config section, bound to `token`
    pub fn from_config(config: &RetryConfig, token: CancellationToken) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            token,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, self.backoff_factor, self.max_delay, attempt)
    }
}

/// Failure outcome of [`retry`]
#[derive(Debug)]
pub enum RetryError<E> {
    /// The token fired before an attempt succeeded
    Cancelled,
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The last underlying error, if attempts were exhausted
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last_error, .. } => Some(last_error),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "retry cancelled"),
            RetryError::Exhausted { attempts, last_error } => {
                write!(f, "failed after {} attempts: {}", attempts, last_error)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl From<RetryError<Error>> for Error {
    fn from(err: RetryError<Error>) -> Self {
        match err {
            RetryError::Cancelled => Error::Cancelled,
            RetryError::Exhausted {
                attempts,
                last_error,
            } => Error::RetryExhausted {
                attempts,
                source: Box::new(last_error),
            },
        }
    }
}

/// Run `operation` until it succeeds or `max_attempts` is reached.
///
/// The operation receives the 1-based attempt number. Each failed attempt is
/// logged before the backoff delay. An in-flight attempt is dropped if the
/// token fires.
pub async fn retry<T, E, F, Fut>(options: &RetryOptions, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if options.token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = options.token.cancelled() => return Err(RetryError::Cancelled),
            result = operation(attempt) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                tracing::warn!("Attempt {}/{} failed: {}. Giving up", attempt, max_attempts, err);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                let wait = options.delay_after(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt,
                    max_attempts,
                    err,
                    wait
                );
                if delay(wait, &options.token).await.is_err() {
                    return Err(RetryError::Cancelled);
                }
            }
        }
    }
}

/// Race `operation` against a timer.
///
/// The operation gets a child of `token`; the child is cancelled when the
/// timer wins (and the operation future is dropped), so work the operation
/// handed off elsewhere can observe the abort too.
pub async fn with_timeout<T, F, Fut>(
    operation: F,
    timeout: Duration,
    message: impl Into<String>,
    token: &CancellationToken,
) -> Result<T, Error>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let child = token.child_token();
    let fut = operation(child.clone());

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(value) => Ok(value),
            Err(_) => {
                child.cancel();
                Err(Error::Timeout(message.into()))
            }
        },
    }
}
