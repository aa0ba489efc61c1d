use std::{future::Future, time::Duration};

use crate::{config::TimeoutPolicyConfig, context::RequestContext, errors::GatewayError};

/// Outermost layer: bounds the whole execution, retries and hedges included.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    #[must_use]
    pub fn from_config(config: &TimeoutPolicyConfig) -> Option<Self> {
        (config.duration_ms > 0).then(|| Self::new(Duration::from_millis(config.duration_ms)))
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Races `fut` against the caller context and the optional per-call timeout.
///
/// Checked in order: the caller being done, then the per-call deadline, then `fut`. A caller
/// that is done always wins, so its cause is what gets reported. Dropping `fut` cancels every
/// attempt still running inside it.
pub async fn run_with_timeout<T, F>(
    ctx: &RequestContext,
    policy: Option<TimeoutPolicy>,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    if let Some(cause) = ctx.cause_if_done() {
        return Err(cause);
    }

    match policy {
        Some(policy) => {
            tokio::select! {
                biased;
                cause = ctx.done() => Err(cause),
                () = tokio::time::sleep(policy.duration) => {
                    Err(GatewayError::EndpointRequestTimeout { timeout: policy.duration })
                }
                result = fut => result,
            }
        }
        None => {
            tokio::select! {
                biased;
                cause = ctx.done() => Err(cause),
                result = fut => result,
            }
        }
    }
}
