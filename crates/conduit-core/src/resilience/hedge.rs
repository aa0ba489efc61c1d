//! Hedged execution against a single upstream.
//!
//! The primary attempt starts immediately. Each time `delay` passes without any attempt
//! completing, another one is launched, up to `max_count` extra attempts. The first attempt
//! to complete decides the outcome, success or failure, and the others are dropped, which
//! cancels their in-flight sends.

use std::{future::Future, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tracing::debug;

use crate::{config::HedgePolicyConfig, errors::GatewayError};

use super::ExecutionState;

#[derive(Debug, Clone, Copy)]
pub struct HedgePolicy {
    delay: Duration,
    max_count: u32,
}

impl HedgePolicy {
    #[must_use]
    pub fn new(delay: Duration, max_count: u32) -> Self {
        Self { delay, max_count }
    }

    /// `None` when the policy would never launch a hedge.
    #[must_use]
    pub fn from_config(config: &HedgePolicyConfig) -> Option<Self> {
        (config.max_count > 0).then(|| Self::new(Duration::from_millis(config.delay_ms), config.max_count))
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Runs `attempt` with hedging. Every launch, primary included, counts as an attempt.
    pub async fn run<T, F, Fut>(&self, state: &ExecutionState, attempt: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut in_flight = FuturesUnordered::new();
        state.record_attempt();
        in_flight.push(attempt());

        let mut launched = 0u32;
        loop {
            if launched >= self.max_count {
                return match in_flight.next().await {
                    Some(result) => result,
                    None => Err(GatewayError::Internal("hedge finished without any attempt".into())),
                };
            }

            tokio::select! {
                biased;
                Some(result) = in_flight.next() => {
                    if launched > 0 {
                        debug!(hedges = launched, "hedged execution settled, cancelling remaining attempts");
                    }
                    return result;
                }
                () = tokio::time::sleep(self.delay) => {
                    launched += 1;
                    state.record_hedge();
                    state.record_attempt();
                    debug!(hedge = launched, delay_ms = self.delay.as_millis(), "hedge delay elapsed, launching another attempt");
                    in_flight.push(attempt());
                }
            }
        }
    }
}
