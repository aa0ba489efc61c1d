//! Caller-side request context: a cancellation token plus an optional deadline.
//!
//! The context lets the pipeline tell apart "the caller gave up" (cancellation or the caller's
//! own deadline) from "this upstream call took too long" (the per-call timeout policy).

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;

#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A context that is never done unless cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), deadline: None, timeout: None }
    }

    /// A context that is done after `timeout` elapses.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(Instant::now() + timeout), timeout: Some(timeout) }
    }

    /// Derives a context cancelled together with this one, with the earlier of both deadlines.
    #[must_use]
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| (Instant::now() + t, t));
        let (deadline, timeout) = match (self.deadline.zip(self.timeout), own) {
            (Some(parent), Some(own)) if own.0 < parent.0 => (Some(own.0), Some(own.1)),
            (Some(parent), _) => (Some(parent.0), Some(parent.1)),
            (None, Some(own)) => (Some(own.0), Some(own.1)),
            (None, None) => (None, None),
        };
        Self { token: self.token.child_token(), deadline, timeout }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time left before the deadline, `None` if there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The reason this context is done, if it is.
    #[must_use]
    pub fn cause_if_done(&self) -> Option<GatewayError> {
        if self.token.is_cancelled() {
            return Some(GatewayError::RequestCanceled);
        }
        match (self.deadline, self.timeout) {
            (Some(deadline), Some(timeout)) if Instant::now() >= deadline => {
                Some(GatewayError::RequestTimeout { timeout })
            }
            _ => None,
        }
    }

    /// Resolves once the context is done, yielding the reason.
    ///
    /// Cancellation takes precedence over the deadline when both are ready.
    pub async fn done(&self) -> GatewayError {
        match (self.deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => GatewayError::RequestCanceled,
                    () = tokio::time::sleep_until(deadline) => GatewayError::RequestTimeout { timeout },
                }
            }
            _ => {
                self.token.cancelled().await;
                GatewayError::RequestCanceled
            }
        }
    }
}
