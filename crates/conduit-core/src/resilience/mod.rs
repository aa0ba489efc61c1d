//! Resilience layers wrapped around every upstream send.
//!
//! ```text
//!  timeout ──▶ retry ──▶ circuit breaker ──▶ hedge ──▶ send
//!  (outer)                                         (inner)
//! ```
//!
//! The order is fixed. The timeout bounds everything including backoff sleeps, the breaker
//! sees one outcome per retry attempt, and hedges race inside a single breaker admission.

pub mod circuit_breaker;
pub mod hedge;
pub mod retry;
pub mod timeout;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use serde::Serialize;
use tracing::debug;

use crate::{
    config::FailsafeConfig, context::RequestContext, errors::GatewayError,
    metrics::MetricsCollector, types::NormalizedResponse,
};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use hedge::HedgePolicy;
pub use retry::RetryPolicy;
pub use timeout::{run_with_timeout, TimeoutPolicy};

/// Snapshot of what one forward cost, attached to its outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounters {
    /// Sends started, hedges included.
    pub attempts: u32,
    pub retries: u32,
    pub hedges: u32,
}

impl std::ops::AddAssign for ExecutionCounters {
    fn add_assign(&mut self, other: Self) {
        self.attempts += other.attempts;
        self.retries += other.retries;
        self.hedges += other.hedges;
    }
}

/// Counters accumulated across all layers of one execution.
#[derive(Debug, Default)]
pub struct ExecutionState {
    attempts: AtomicU32,
    retries: AtomicU32,
    hedges: AtomicU32,
}

impl ExecutionState {
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hedge(&self) {
        self.hedges.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ExecutionCounters {
        ExecutionCounters {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            hedges: self.hedges.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    /// Retry successful responses whose result is empty while attempts remain.
    pub retry_empty: bool,
}

/// The composed policies of one upstream. The breaker state lives as long as the pipeline.
#[derive(Debug)]
pub struct ResiliencePipeline {
    upstream_id: String,
    timeout: Option<TimeoutPolicy>,
    retry: Option<RetryPolicy>,
    breaker: Option<Arc<CircuitBreaker>>,
    hedge: Option<HedgePolicy>,
}

impl ResiliencePipeline {
    #[must_use]
    pub fn from_config(
        upstream_id: &str,
        config: &FailsafeConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            upstream_id: upstream_id.to_string(),
            timeout: config.timeout.as_ref().and_then(TimeoutPolicy::from_config),
            retry: config.retry.as_ref().map(RetryPolicy::from_config),
            breaker: config
                .circuit_breaker
                .as_ref()
                .map(|cb| Arc::new(CircuitBreaker::new(upstream_id, cb, metrics))),
            hedge: config.hedge.as_ref().and_then(HedgePolicy::from_config),
        }
    }

    /// A pipeline with no layers besides honoring the caller context.
    #[must_use]
    pub fn passthrough(upstream_id: &str) -> Self {
        Self::from_config(upstream_id, &FailsafeConfig::default(), None)
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<TimeoutPolicy> {
        self.timeout
    }

    /// Runs `attempt` through every configured layer.
    ///
    /// `state` is filled in as the execution proceeds, so counters are available whether it
    /// succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns the caller's cause if `ctx` is done first, [`GatewayError::EndpointRequestTimeout`]
    /// on the per-call timeout, [`GatewayError::FailsafeRetryExceeded`] once retries of a
    /// retryable failure run out, and otherwise the error of the last attempt.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &RequestContext,
        state: &ExecutionState,
        options: ExecutionOptions,
        attempt: F,
    ) -> Result<NormalizedResponse, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<NormalizedResponse, GatewayError>>,
    {
        run_with_timeout(ctx, self.timeout, self.run_retries(state, options, &attempt)).await
    }

    async fn run_retries<F, Fut>(
        &self,
        state: &ExecutionState,
        options: ExecutionOptions,
        attempt: &F,
    ) -> Result<NormalizedResponse, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<NormalizedResponse, GatewayError>>,
    {
        let max_attempts = self.retry.as_ref().map_or(1, RetryPolicy::max_attempts);
        let mut last_empty: Option<NormalizedResponse> = None;
        let mut n = 0u32;

        loop {
            n += 1;
            if n > 1 {
                state.record_retry();
                if let Some(delay) = self.retry.as_ref().map(|r| r.delay_for(n - 1)) {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            match self.run_breaker(state, attempt).await {
                Ok(response) => {
                    if options.retry_empty && n < max_attempts && response.is_result_emptyish() {
                        debug!(upstream = %self.upstream_id, attempt = n, "empty result, retrying");
                        last_empty = Some(response);
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if let Some(retry) = &self.retry {
                        if retry.should_retry(&err, n) {
                            debug!(upstream = %self.upstream_id, attempt = n, error = %err, "retrying after failure");
                            continue;
                        }
                    }
                    if let Some(response) = last_empty {
                        return Ok(response);
                    }
                    if n > 1 && err.is_retryable() {
                        return Err(GatewayError::FailsafeRetryExceeded { attempts: n, cause: Box::new(err) });
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn run_breaker<F, Fut>(
        &self,
        state: &ExecutionState,
        attempt: &F,
    ) -> Result<NormalizedResponse, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<NormalizedResponse, GatewayError>>,
    {
        if let Some(breaker) = &self.breaker {
            if !breaker.can_execute().await {
                return Err(GatewayError::CircuitBreakerOpen { upstream: self.upstream_id.clone() });
            }
        }

        let result = match &self.hedge {
            Some(hedge) => hedge.run(state, attempt).await,
            None => {
                state.record_attempt();
                attempt().await
            }
        };

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.on_success().await,
                Err(e) if e.should_trip_breaker() => breaker.on_failure().await,
                Err(_) => {}
            }
        }
        result
    }
}
