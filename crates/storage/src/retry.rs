use std::future::Future;
use std::time::Duration;

use crate::error::Retryable;

/// Initial backoff delay of store transactions in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 10;

/// Upper bound for a single store backoff sleep.
const MAX_BACKOFF_MS: u64 = 1_000;

/// How often and how patiently [`retry_with_backoff`] retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff sleep; doubles each retry.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy of [`with_store_retry`].
    pub fn store(max_retries: u32) -> Self {
        Self::new(
            max_retries,
            Duration::from_millis(INITIAL_BACKOFF_MS),
            Duration::from_millis(MAX_BACKOFF_MS),
        )
    }
}

/// Call `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. The last error is returned as is.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && e.is_retryable() => {
                attempt += 1;
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_retries + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying after error"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a whole transaction, re-running it on retryable errors.
///
/// `op` must begin, use and commit (or abort) its own snapshot each time it is
/// called, so every attempt starts from fresh reads. At most `max_retries`
/// retries follow the first attempt.
pub async fn with_store_retry<T, E, F, Fut>(max_retries: u32, op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff(RetryPolicy::store(max_retries), op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, StorageError> = with_store_retry(3, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StorageError::ConcurrentConflict {
                    record: "job".to_string(),
                    expected_revision: 1,
                })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = with_store_retry(2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = with_store_retry(5, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::not_found("job", "x"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(25));
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let result: Result<(), StorageError> = retry_with_backoff(policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 10 + 20 + 25 + 25
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
