//! Circuit breaker for resilient remote calls

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// One probe call decides whether the service has recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

/// Three-state breaker tracking consecutive failures
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
            })),
        }
    }

    /// Whether a call may be attempted right now.
    ///
    /// Returns false only while the circuit is open and `open_for` has not
    /// elapsed; an expired open circuit transitions to half-open here.
    pub async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;
        match state.current {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_for)
                    .unwrap_or(true);
                if expired {
                    info!("circuit breaker '{}' transitioning to half-open", self.name);
                    state.current = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. From any state this closes the circuit and
    /// clears the failure count.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if state.current != CircuitState::Closed {
            info!("circuit breaker '{}' closing after success", self.name);
        }
        state.current = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_at = Some(Instant::now());
        match state.current {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "circuit breaker '{}' opening after {} consecutive failures",
                        self.name, state.consecutive_failures
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "circuit breaker '{}' reopening after half-open failure",
                    self.name
                );
                state.current = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_failures += 1;
            }
            CircuitState::Open => {
                debug!(
                    "recording failure while circuit breaker '{}' is open",
                    self.name
                );
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.current
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.current,
            consecutive_failures: state.consecutive_failures,
            open_remaining: state.opened_at.and_then(|at| {
                self.config.open_for.checked_sub(at.elapsed())
            }),
        }
    }

    /// Reset to closed with zero failures
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!("resetting circuit breaker '{}'", self.name);
        state.current = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Execute `operation` under breaker protection. When the circuit is
    /// open the operation is not attempted and the call fails fast with
    /// `UpstreamUnavailable`.
    pub async fn call<F, T>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if !self.can_attempt().await {
            return Err(Error::UpstreamUnavailable(format!(
                "circuit breaker '{}' is open",
                self.name
            )));
        }
        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }
}

/// Snapshot of breaker state for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_remaining: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn breaker(threshold: u32, open_for_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_for: Duration::from_millis(open_for_ms),
            },
        )
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb = breaker(3, 100);
        for _ in 0..2 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.can_attempt().await);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = breaker(3, 100);
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_on_success() {
        let cb = breaker(2, 20);
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        sleep(Duration::from_millis(30)).await;
        assert!(cb.can_attempt().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        let stats = cb.stats().await;
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let cb = breaker(2, 20);
        cb.record_failure().await;
        cb.record_failure().await;
        sleep(Duration::from_millis(30)).await;
        assert!(cb.can_attempt().await);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.can_attempt().await);
    }

    #[tokio::test]
    async fn call_fails_fast_when_open() {
        let cb = breaker(1, 10_000);
        let _ = cb
            .call(async { Err::<(), _>(Error::Network("boom".into())) })
            .await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, Error>(42) }).await;
        match result {
            Err(Error::UpstreamUnavailable(_)) => {}
            other => panic!("expected fast failure, got {:?}", other),
        }
    }
}
