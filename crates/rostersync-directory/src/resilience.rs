//! Retry logic with exponential backoff for store operations.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::DirectoryResult;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry executor with exponential backoff.
///
/// Only transient errors are retried. The first permanent error, or the
/// last transient one once the budget is spent, is returned to the caller.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calculate delay for a given attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.config.max_delay.as_millis() as f64);

        let final_delay = if self.config.jitter {
            // Up to 25% on top, still capped
            (delay_ms * (1.0 + jitter_fraction() * 0.25))
                .min(self.config.max_delay.as_millis() as f64)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Execute an operation with retries.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> DirectoryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DirectoryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pseudo-random fraction in `[0, 1)` for jitter. Not cryptographically secure.
fn jitter_fraction() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn test_backoff_is_capped() {
        let executor = RetryExecutor::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(executor.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(executor.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(executor.calculate_delay(20), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let executor = RetryExecutor::with_defaults();
        for attempt in 0..30 {
            assert!(executor.calculate_delay(attempt) <= Duration::from_secs(10));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .execute(|_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DirectoryError::connection_failed("refused"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DirectoryResult<()> = fast()
            .execute(|_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::not_found("uid=x,ou=y"))
            })
            .await;

        assert!(matches!(result, Err(DirectoryError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: DirectoryResult<()> = fast()
            .execute(|_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DirectoryError::Unavailable {
                    message: "busy".to_string(),
                })
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
