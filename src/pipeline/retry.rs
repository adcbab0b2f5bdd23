//! Bounded retry with exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::vcs::ExternalError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable: std::error::Error {
    fn is_transient(&self) -> bool;

    /// The error to report when an attempt exceeds its time limit.
    fn timed_out(operation: &str, limit: Duration) -> Self
    where
        Self: Sized;
}

impl Retryable for ExternalError {
    fn is_transient(&self) -> bool {
        ExternalError::is_transient(self)
    }

    fn timed_out(operation: &str, limit: Duration) -> Self {
        ExternalError::Timeout {
            operation: operation.to_string(),
            limit,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Failed on an error that retrying cannot fix.
    #[error("{0}")]
    Permanent(E),

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (2 means 3 attempts in total)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. Each attempt is cut off after `attempt_timeout`, which
    /// counts as a transient failure.
    pub async fn with_retry<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(E::timed_out(name, self.attempt_timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    debug!(operation = name, attempt, error = %e, "permanent failure, not retrying");
                    return Err(RetryError::Permanent(e));
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(operation = name, attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::PermanentKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_default_is_three_attempts() {
        assert_eq!(RetryPolicy::default().max_retries + 1, 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_delay: Duration::from_millis(350),
            ..policy()
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = policy()
            .with_retry("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExternalError::transient("op", "503"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .with_retry("merge", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExternalError::permanent("merge", PermanentKind::MergeConflict, "dirty")) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .with_retry("merge", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(ExternalError::transient("merge", format!("attempt {n}"))) }
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, ExternalError::transient("merge", "attempt 2"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_as_transient() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .with_retry("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<(), ExternalError>(())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err().into_inner();
        assert!(matches!(err, ExternalError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        let result: Result<(), _> = p
            .with_retry("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExternalError::transient("op", "429")) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_at_u32_max_still_attempts() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            max_retries: u32::MAX,
            ..policy()
        };
        let result = p
            .with_retry("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ExternalError>(()) }
            })
            .await;
        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
