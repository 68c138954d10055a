use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops calling a failing store for `timeout` after `failure_threshold`
/// consecutive transient failures, then lets one trial request through.
pub struct CircuitBreaker {
    state: RwLock<(CircuitState, Option<Instant>)>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new((CircuitState::Closed, None)),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            timeout,
        }
    }

    pub async fn can_execute(&self) -> bool {
        let (state, opened_at) = *self.state.read().await;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match opened_at {
                Some(time) if time.elapsed() >= self.timeout => {
                    let mut guard = self.state.write().await;
                    if guard.0 == CircuitState::Open {
                        debug!("Circuit breaker transitioning to half-open");
                        guard.0 = CircuitState::HalfOpen;
                    }
                    true
                }
                _ => false,
            },
        }
    }

    pub async fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        let mut guard = self.state.write().await;
        if guard.0 != CircuitState::Closed {
            debug!("Circuit breaker closing");
            *guard = (CircuitState::Closed, None);
        }
    }

    pub async fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.state.write().await;
        let trip = match guard.0 {
            // a failed trial request reopens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Closed => count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                count
            );
            *guard = (CircuitState::Open, Some(Instant::now()));
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.0
    }
}
