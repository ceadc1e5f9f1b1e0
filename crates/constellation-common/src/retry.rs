//! Retry with exponential backoff and jitter.
//!
//! Only errors whose kind is retryable (see [`Error::is_retryable`]) are
//! retried. Verification and configuration errors return immediately, and a
//! fired cancellation token aborts both the running attempt and the backoff
//! sleep.
//!
//! # Example
//!
//! ```ignore
//! use constellation_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let doc = retry_with_backoff(
//!     &RetryConfig::network(),
//!     "fetch_measurements",
//!     &cancel,
//!     || async { downloader.get(&url).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Backoff parameters for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// CDN and transparency-log requests: 3 attempts, 500ms doubling up to 4s
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        }
    }

    /// Optimistic-concurrency retries against the cluster object store
    pub fn conflict() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Sleep for a jittered delay (0.5x to 1.5x), returning early on cancellation.
pub async fn jittered_sleep(
    delay: Duration,
    cancel: &CancellationToken,
    operation_name: &str,
) -> Result<(), Error> {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation_name)),
        _ = tokio::time::sleep(jittered) => Ok(()),
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Non-retryable errors and exhaustion of `max_attempts` return the error of
/// the last attempt. Cancellation yields [`Error::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            r = operation() => r,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                jittered_sleep(delay, cancel, operation_name).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&fast(3), "op", &token, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result = retry_with_backoff(&fast(5), "op", &token, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transport("cdn", "connection reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result: Result<(), Error> = retry_with_backoff(&fast(3), "op", &token, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("cdn", "timeout"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Transport { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_verification_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result: Result<(), Error> = retry_with_backoff(&fast(3), "op", &token, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::verification("signature", "mismatch"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::VerificationFailed { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), Error> = retry_with_backoff(&fast(3), "fetch", &token, || async {
            Err(Error::transport("cdn", "timeout"))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::network();
        assert_eq!(config.delay_for(1), Duration::from_millis(500));
        assert_eq!(config.delay_for(2), Duration::from_secs(1));
        assert_eq!(config.delay_for(10), Duration::from_secs(4));
    }
}
