use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::{config::CircuitBreakerPolicyConfig, metrics::MetricsCollector};

/// Mutable breaker state, kept under a single lock so transitions are atomic.
#[derive(Debug)]
struct CircuitBreakerInternalState {
    /// Most recent outcomes, `true` for a failure. Bounded by the window capacity.
    window: VecDeque<bool>,
    failures_in_window: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    state: CircuitBreakerState,
}

impl CircuitBreakerInternalState {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            failures_in_window: 0,
            half_open_successes: 0,
            opened_at: None,
            state: CircuitBreakerState::Closed,
        }
    }

    fn reset_window(&mut self) {
        self.window.clear();
        self.failures_in_window = 0;
        self.half_open_successes = 0;
    }
}

/// Breaker protecting one upstream.
///
/// Opens once `failure_threshold_count` of the last `failure_threshold_capacity` outcomes
/// are failures. After `half_open_after` it lets trial requests through; any trial failure
/// re-opens it and `success_threshold_count` trial successes close it.
pub struct CircuitBreaker {
    upstream_id: String,
    inner: Arc<RwLock<CircuitBreakerInternalState>>,
    failure_threshold: u32,
    window_capacity: usize,
    half_open_after: Duration,
    success_threshold: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: failures in the window reach the threshold
/// - `Open` -> `HalfOpen`: `half_open_after` elapsed
/// - `HalfOpen` -> `Closed`: enough trial successes
/// - `HalfOpen` -> `Open`: any trial failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        upstream_id: impl Into<String>,
        config: &CircuitBreakerPolicyConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let window_capacity = config.failure_threshold_capacity.max(1) as usize;
        Self {
            upstream_id: upstream_id.into(),
            inner: Arc::new(RwLock::new(CircuitBreakerInternalState::new(window_capacity))),
            failure_threshold: config.failure_threshold_count.max(1),
            window_capacity,
            half_open_after: Duration::from_millis(config.half_open_after_ms),
            success_threshold: config.success_threshold_count.max(1),
            metrics,
        }
    }

    fn transition(&self, inner: &mut CircuitBreakerInternalState, to: CircuitBreakerState) {
        inner.state = to;
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_state(&self.upstream_id, to);
        }
    }

    /// Whether a request may go through. Moves `Open` to `HalfOpen` once the wait elapsed.
    ///
    /// Double-checked: the read lock serves the common case, the write lock is only taken
    /// for the transition.
    pub async fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => return true,
                CircuitBreakerState::Open => match inner.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= self.half_open_after => {}
                    _ => return false,
                },
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => match inner.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.half_open_after => {
                    inner.half_open_successes = 0;
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    tracing::warn!(upstream = %self.upstream_id, "circuit breaker transitioning to half-open state");
                    true
                }
                _ => false,
            },
        }
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => self.push_outcome(&mut inner, false),
            CircuitBreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    inner.reset_window();
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitBreakerState::Closed);
                    tracing::info!(upstream = %self.upstream_id, "circuit breaker closed after successful trial requests");
                }
            }
            // a request admitted before the circuit opened
            CircuitBreakerState::Open => {}
        }
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => {
                self.push_outcome(&mut inner, true);
                if inner.failures_in_window >= self.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitBreakerState::Open);
                    tracing::warn!(
                        upstream = %self.upstream_id,
                        threshold = self.failure_threshold,
                        window = self.window_capacity,
                        "circuit breaker opened after reaching failure threshold"
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                inner.reset_window();
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitBreakerState::Open);
                tracing::warn!(upstream = %self.upstream_id, "circuit breaker re-opened after failed trial request");
            }
            CircuitBreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    fn push_outcome(&self, inner: &mut CircuitBreakerInternalState, failed: bool) {
        if inner.window.len() == self.window_capacity && inner.window.pop_front() == Some(true) {
            inner.failures_in_window -= 1;
        }
        inner.window.push_back(failed);
        if failed {
            inner.failures_in_window += 1;
        }
    }

    pub async fn get_state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }

    /// Failures within the current window.
    pub async fn get_failure_count(&self) -> u32 {
        self.inner.read().await.failures_in_window
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("upstream_id", &self.upstream_id)
            .field("failure_threshold", &self.failure_threshold)
            .field("window_capacity", &self.window_capacity)
            .field("half_open_after", &self.half_open_after)
            .finish_non_exhaustive()
    }
}
