//! Retry logic with exponential backoff
//!
//! Used in two places:
//! - the historian work queues, which requeue a failed item after
//!   [`RetryPolicy::backoff_delay`] for its attempt number
//! - provider start-up, where connecting to the backing store is retried
//!   with [`retry_async`] while the error is retryable
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_core::retry::{RetryPolicy, retry_async};
//!
//! let policy = RetryPolicy::default();
//! let conn = retry_async(&policy, || async { connect(&url).await }).await?;
//! ```

use crate::error::Error;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff delay
    pub initial_delay: Duration,

    /// Maximum backoff delay (caps exponential growth)
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,

    /// Add random jitter to prevent thundering herd (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Per-item requeue policy of the historian queues
    ///
    /// 5ms doubling up to 1000s, retried until the item succeeds.
    pub fn queue() -> Self {
        Self {
            max_retries: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Calculate backoff delay for a given attempt
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        // Add jitter: random value between (1 - jitter) and (1 + jitter)
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_factor;
        let final_delay = (capped_delay * jitter) as u64;

        Duration::from_millis(final_delay)
    }
}

/// Retry an async operation while it fails with a retryable [`Error`]
///
/// Non-retryable errors are returned immediately.
pub async fn retry_async<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempts = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(attempts, ?total_delay, "operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                if attempts > policy.max_retries {
                    warn!(attempts, ?total_delay, %error, "operation failed, giving up");
                    return Err(error);
                }

                let delay = policy.backoff_delay(attempts - 1);
                total_delay += delay;
                debug!(attempts, ?delay, %error, "operation failed, retrying");

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let policy = RetryPolicy::queue();

        assert_eq!(policy.backoff_delay(0), Duration::from_millis(5));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = RetryPolicy::queue();
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(1000));
        assert_eq!(policy.backoff_delay(usize::MAX), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn test_retry_async_succeeds_after_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result = retry_async(&fast(), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::state("connection refused"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_exhausts_retries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result: Result<(), Error> = retry_async(&fast(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::state("down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4); // max_retries + 1
    }

    #[tokio::test]
    async fn test_retry_async_stops_on_permanent_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let result: Result<(), Error> = retry_async(&fast(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::config("bad url"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
