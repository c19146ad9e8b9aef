//! Generic bounded-retry-with-backoff helper.
//!
//! Retries a single adapter call a bounded number of times with
//! exponential backoff before giving up and letting the caller escalate
//! to a partition failure.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Classifies whether an error is worth retrying. Non-retryable errors
/// abort the loop immediately regardless of remaining attempts.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Runs `op` until it succeeds, a non-retryable error is returned, or the
/// retry budget is exhausted (in which case the last error is returned).
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts || !err.is_retryable() => {
                return Err(err);
            }
            Err(_) => {
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2 + 1);
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = std::cmp::min(backoff * 2, policy.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Boom(bool);
    impl Retryable for Boom {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_after_retries() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let result: Result<i32, Boom> = retry_with_backoff(policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Boom(true))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<i32, Boom> = retry_with_backoff(policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(Boom(false)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let result: Result<i32, Boom> = retry_with_backoff(policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(Boom(true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
