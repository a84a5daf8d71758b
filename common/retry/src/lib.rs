//! Bounded exponential backoff for operations against flaky backends.
//!
//! Every port that talks to the outside world (broker, cache, store,
//! inference) funnels its transient failures through [`retry`], so the
//! classification of what is worth retrying lives with the error type, not
//! with the call site.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How a failed operation should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; worth another attempt after a backoff sleep.
    Retryable,
    /// No amount of retrying will help; surface immediately.
    Fatal,
}

/// Implemented by error types that can tell transient failures apart from
/// permanent ones.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_secs(2),
            maximum_interval: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_interval,
            ..Default::default()
        }
    }

    pub fn with_maximum_interval(mut self, maximum_interval: Duration) -> Self {
        self.maximum_interval = maximum_interval;
        self
    }

    /// Adds up to one second of random jitter to every sleep, which keeps a
    /// fleet of workers from hammering a recovering backend in lockstep.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Sleep before attempt `attempt + 1`, doubling per attempt and capped
    /// at `maximum_interval`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_interval
            .saturating_mul(2u32.saturating_pow(attempt));
        let base = exp.min(self.maximum_interval);
        if self.jitter {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
        } else {
            base
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("operation failed with a fatal error: {0}")]
    Fatal(E),
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, whichever way the retry loop gave up.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal(source) => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, exhausts the policy, or the
/// token fires. The token is honored at every backoff sleep, never
/// mid-operation.
pub async fn retry<T, E, F, Fut>(
    token: &CancellationToken,
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.classify() == ErrorClass::Fatal => {
                return Err(RetryError::Fatal(err));
            }
            Err(err) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "{what} failed, retrying"
                );
                last_err = Some(err);

                tokio::select! {
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    match last_err {
        Some(source) => Err(RetryError::Exhausted {
            attempts: policy.max_attempts,
            source,
        }),
        // max_attempts == 0 never ran the operation; treat as cancelled work.
        None => Err(RetryError::Cancelled),
    }
}
