//! Bounded retry with exponential backoff.
//!
//! [`RetryExecutor`] wraps any fallible async operation. Only
//! [`ErrorKind::Temporary`](crate::error::ErrorKind) errors are retried; fatal
//! and permanent errors propagate on their first occurrence. A run ends when
//! either the attempt budget or the wall-clock timeout is spent, surfacing
//! the last error.

use crate::config::humantime_serde;
use crate::error::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay before first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Add jitter to delays.
    pub jitter: bool,
    /// Wall-clock budget for the whole run.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            timeout: None,
        }
    }
}

impl RetryConfig {
    /// Policy for a full cluster diagnosis pass: many quick attempts bounded
    /// by a wall-clock timeout.
    pub fn diagnosis() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 1.5,
            jitter: true,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Single attempt, no backoff.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            timeout: None,
        }
    }

    /// Calculate delay for a given attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            // up to 25% extra
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
        } else {
            delay
        }
    }
}

/// Retry executor with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy this executor applies.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `f` until it succeeds, fails non-retriably, or the budget runs out.
    ///
    /// A delay suggested by the error takes precedence over the backoff
    /// schedule, still capped by `max_delay` and the remaining timeout.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match f().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= self.config.max_attempts {
                tracing::debug!(operation = what, attempt, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let mut delay = err
                .retry_delay()
                .map(|d| d.min(self.config.max_delay))
                .unwrap_or_else(|| self.config.delay_for_attempt(attempt));

            if let Some(timeout) = self.config.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    tracing::debug!(operation = what, attempt, error = %err, "Retry timeout expired");
                    return Err(err);
                }
                delay = delay.min(timeout - elapsed);
            }

            tracing::debug!(
                operation = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            sleep(delay).await;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, DbError, OperatorError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let retry = RetryExecutor::new(fast(3));
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<u32> = retry
            .execute("probe", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DbError::new(codes::CONN_HOST_ERROR, "unreachable").into())
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
    async fn test_fatal_error_not_retried() {
        let retry = RetryExecutor::new(fast(5));
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry
            .execute("probe", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DbError::new(codes::ACCESS_DENIED, "denied").into())
                }
            })
            .await;

        assert_eq!(result.unwrap_err().db_code(), Some(codes::ACCESS_DENIED));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let retry = RetryExecutor::new(fast(5));
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry
            .execute("repair", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(OperatorError::permanent("SplitBrain", "two primaries"))
                }
            })
            .await;

        assert!(matches!(result, Err(OperatorError::Permanent { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let retry = RetryExecutor::new(fast(2));
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry
            .execute("probe", || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(OperatorError::temporary(format!("attempt {}", n)))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "attempt 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_timeout() {
        let config = RetryConfig {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            multiplier: 1.0,
            jitter: false,
            timeout: Some(Duration::from_secs(5)),
        };
        let retry = RetryExecutor::new(config);
        let counter = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry
            .execute("diagnose", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(OperatorError::temporary("stale view"))
                }
            })
            .await;

        assert!(result.is_err());
        let attempts = counter.load(Ordering::SeqCst);
        assert!((5..=7).contains(&attempts), "attempts = {}", attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suggested_delay_is_honoured() {
        let retry = RetryExecutor::new(RetryConfig {
            max_delay: Duration::from_secs(60),
            ..fast(2)
        });
        let started = tokio::time::Instant::now();

        let _: Result<()> = retry
            .execute("create", || async {
                Err(OperatorError::temporary_after("wait", Duration::from_secs(7)))
            })
            .await;

        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[test]
    fn test_retry_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
    }
}
