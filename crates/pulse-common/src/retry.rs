//! Retry with capped exponential backoff

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay; attempt n waits `base · 2^(n-1)`, capped at `max_delay`
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after `attempt` failures (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// Execute `operation` with retries. Only retryable errors (per
/// [`Error::is_retryable`]) are attempted again; the rest fail immediately.
pub async fn run_with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        debug!(
            "executing {} (attempt {}/{})",
            operation_name, attempt, config.max_attempts
        );

        let outcome = match config.attempt_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "{} timed out on attempt {}",
                    operation_name, attempt
                ))),
            },
            None => operation().await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(
                    "{} failed on attempt {}: {} (retryable: {})",
                    operation_name, attempt, e, retryable
                );
                if !retryable {
                    return Err(e);
                }
                last_error = Some(e);
                if attempt < config.max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    debug!("waiting {:?} before retrying {}", delay, operation_name);
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Internal(format!("{} exhausted retries", operation_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            attempt_timeout: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            attempt_timeout: None,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = run_with_retry("test_op", &quick_config(3), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("transient".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_validation_errors() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = run_with_retry("test_op", &quick_config(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad input".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let result: Result<()> = run_with_retry("test_op", &quick_config(3), || async {
            Err(Error::Timeout("persistent".into()))
        })
        .await;
        match result {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
