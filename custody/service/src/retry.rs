// Copyright (c) 2024 The Botho Foundation

//! Bounded retry with linear backoff.
//!
//! Every chain call goes through [`retry`]; callers get either the value or a
//! [`RetryError`] naming the operation, so no retry loops live elsewhere.

use std::{future::Future, time::Duration};
use tracing::warn;

use crate::metrics;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Attempt budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `base_delay * n`
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("{operation} failed: {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::Exhausted { operation, .. } | RetryError::Permanent { operation, .. } => {
                operation
            }
        }
    }

    /// The error of the last attempt.
    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget is spent.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    operation: &'static str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                return Err(RetryError::Permanent {
                    operation,
                    source: e,
                })
            }
            Err(e) if attempt >= policy.max_attempts => {
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                metrics::RPC_RETRIES.with_label_values(&[operation]).inc();
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<TestError>> =
            retry("flaky_op", fast_policy(3), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let result: Result<(), RetryError<TestError>> =
            retry("always_flaky", fast_policy(2), |_| async { Err(TestError::Flaky) }).await;

        match result {
            Err(RetryError::Exhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "always_flaky");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<TestError>> = retry("fatal_op", fast_policy(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
