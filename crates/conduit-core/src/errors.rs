//! Engine-level error taxonomy.
//!
//! Every layer wraps the error it receives instead of replacing it, so the root cause
//! is always reachable. [`GatewayError::code_chain`] renders the wrapping path, e.g.
//! `ErrUpstreamRequest <- ErrFailsafeRetryExceeded <- ErrEndpointServerSideException`.
//!
//! The classification methods drive everything downstream of a failure: log severity
//! (`is_client_side`), retries (`is_retryable`), HTTP status and the JSON-RPC error body.

use std::time::Duration;

use thiserror::Error;

use crate::{
    resilience::ExecutionCounters,
    types::{EvmNodeType, JsonRpcError},
    upstream::errors::UpstreamError,
    utils::wildcard::WildcardError,
};

/// Error wrapping the final failure of a forward to one upstream, with its context.
#[derive(Debug, Error)]
#[error("request to upstream {upstream} failed after {attempts} attempt(s): {cause}", attempts = .counters.attempts)]
pub struct UpstreamRequestError {
    pub upstream: String,
    pub network: String,
    pub method: String,
    pub elapsed: Duration,
    pub counters: ExecutionCounters,
    #[source]
    pub cause: GatewayError,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid url path: {0}")]
    InvalidUrlPath(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("upstream {upstream} is syncing")]
    UpstreamSyncing { upstream: String },

    #[error("method {method} is ignored by upstream {upstream}")]
    UpstreamMethodIgnored { method: String, upstream: String },

    #[error("upstream {upstream} is excluded by the use-upstream directive")]
    UpstreamNotAllowed { upstream: String },

    #[error(
        "upstream {upstream} is a {node_type} node and cannot serve block {block} (latest {latest_block}, keeps {max_recent_blocks} recent blocks)"
    )]
    UpstreamNodeTypeMismatch {
        upstream: String,
        block: u64,
        latest_block: u64,
        max_recent_blocks: u64,
        node_type: EvmNodeType,
    },

    #[error("request skipped by upstream {upstream}: {reason}")]
    UpstreamRequestSkipped {
        upstream: String,
        #[source]
        reason: Box<GatewayError>,
    },

    #[error(transparent)]
    InvalidPattern(#[from] WildcardError),

    #[error("rate limit budget not found: {budget}")]
    RateLimitBudgetNotFound { budget: String },

    #[error("upstream {upstream} exceeded rule '{rule}' of rate limit budget {budget}")]
    UpstreamRateLimitRuleExceeded {
        upstream: String,
        budget: String,
        rule: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream request timed out after {timeout:?}")]
    EndpointRequestTimeout { timeout: Duration },

    #[error("request deadline of {timeout:?} exceeded")]
    RequestTimeout { timeout: Duration },

    #[error("request canceled by the caller")]
    RequestCanceled,

    #[error("circuit breaker is open for upstream {upstream}")]
    CircuitBreakerOpen { upstream: String },

    #[error("retries exhausted after {attempts} attempts: {cause}")]
    FailsafeRetryExceeded {
        attempts: u32,
        #[source]
        cause: Box<GatewayError>,
    },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    UpstreamRequest(Box<UpstreamRequestError>),

    #[error("all {} upstream(s) of network {network} failed", .errors.len())]
    UpstreamsExhausted {
        network: String,
        errors: Vec<(String, GatewayError)>,
        counters: ExecutionCounters,
    },

    #[error("failed to initialize client for upstream {upstream}: {reason}")]
    UpstreamClientInitialization { upstream: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<UpstreamRequestError> for GatewayError {
    fn from(err: UpstreamRequestError) -> Self {
        Self::UpstreamRequest(Box::new(err))
    }
}

impl GatewayError {
    /// Stable error code for logs, metric labels and code chains.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "ErrInvalidRequest",
            Self::InvalidUrlPath(_) => "ErrInvalidUrlPath",
            Self::Unauthorized(_) => "ErrAuthUnauthorized",
            Self::ProjectNotFound(_) => "ErrProjectNotFound",
            Self::NetworkNotFound(_) => "ErrNetworkNotFound",
            Self::MethodNotFound(_) => "ErrMethodNotFound",
            Self::UpstreamSyncing { .. } => "ErrUpstreamSyncing",
            Self::UpstreamMethodIgnored { .. } => "ErrUpstreamMethodIgnored",
            Self::UpstreamNotAllowed { .. } => "ErrUpstreamNotAllowed",
            Self::UpstreamNodeTypeMismatch { .. } => "ErrUpstreamNodeTypeMismatch",
            Self::UpstreamRequestSkipped { .. } => "ErrUpstreamRequestSkipped",
            Self::InvalidPattern(_) => "ErrInvalidPattern",
            Self::RateLimitBudgetNotFound { .. } => "ErrRateLimitBudgetNotFound",
            Self::UpstreamRateLimitRuleExceeded { .. } => "ErrUpstreamRateLimitRuleExceeded",
            Self::EndpointRequestTimeout { .. } => "ErrEndpointRequestTimeout",
            Self::RequestTimeout { .. } => "ErrRequestTimeout",
            Self::RequestCanceled => "ErrRequestCanceled",
            Self::CircuitBreakerOpen { .. } => "ErrFailsafeCircuitBreakerOpen",
            Self::FailsafeRetryExceeded { .. } => "ErrFailsafeRetryExceeded",
            Self::Upstream(e) => e.code(),
            Self::UpstreamRequest(_) => "ErrUpstreamRequest",
            Self::UpstreamsExhausted { .. } => "ErrUpstreamsExhausted",
            Self::UpstreamClientInitialization { .. } => "ErrUpstreamClientInitialization",
            Self::Internal(_) => "ErrInternal",
        }
    }

    /// The wrapped engine error, if this error is a wrapper.
    #[must_use]
    pub fn inner(&self) -> Option<&GatewayError> {
        match self {
            Self::UpstreamRequest(wrapped) => Some(&wrapped.cause),
            Self::FailsafeRetryExceeded { cause, .. } => Some(cause),
            Self::UpstreamRequestSkipped { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The innermost error of the wrapping chain.
    #[must_use]
    pub fn root(&self) -> &GatewayError {
        let mut current = self;
        while let Some(next) = current.inner() {
            current = next;
        }
        current
    }

    /// Renders the wrapping path, outermost first.
    #[must_use]
    pub fn code_chain(&self) -> String {
        let mut codes = vec![self.code()];
        let mut current = self;
        while let Some(next) = current.inner() {
            codes.push(next.code());
            current = next;
        }
        codes.join(" <- ")
    }

    /// Message of the innermost error.
    #[must_use]
    pub fn deepest_message(&self) -> String {
        self.root().to_string()
    }

    /// Returns `true` if the request itself is at fault. Such errors are never retried and
    /// are logged at debug level.
    #[must_use]
    pub fn is_client_side(&self) -> bool {
        match self {
            Self::InvalidRequest(_) |
            Self::InvalidUrlPath(_) |
            Self::Unauthorized(_) |
            Self::ProjectNotFound(_) |
            Self::NetworkNotFound(_) |
            Self::MethodNotFound(_) |
            Self::InvalidPattern(_) |
            Self::RequestCanceled => true,
            Self::Upstream(e) => e.is_client_side(),
            _ => self.inner().is_some_and(GatewayError::is_client_side),
        }
    }

    /// Returns `true` for exclusions decided before any network call.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        match self {
            Self::UpstreamSyncing { .. } |
            Self::UpstreamMethodIgnored { .. } |
            Self::UpstreamNotAllowed { .. } |
            Self::UpstreamNodeTypeMismatch { .. } |
            Self::UpstreamRequestSkipped { .. } => true,
            Self::Upstream(UpstreamError::Skipped(_)) => true,
            Self::UpstreamRequest(wrapped) => wrapped.cause.is_skip(),
            _ => false,
        }
    }

    /// Returns `true` if a retry against the same upstream may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_transient(),
            Self::EndpointRequestTimeout { .. } => true,
            Self::UpstreamRequest(wrapped) => wrapped.cause.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if the upstream reported it is over capacity, or our own budget refused.
    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        match self {
            Self::UpstreamRateLimitRuleExceeded { .. } => true,
            Self::Upstream(e) => {
                matches!(e, UpstreamError::CapacityExceeded { .. }) ||
                    matches!(e, UpstreamError::HttpError(429, _)) ||
                    e.rpc_category() == Some(crate::upstream::errors::RpcErrorCategory::RateLimit)
            }
            Self::UpstreamsExhausted { errors, .. } => {
                !errors.is_empty() && errors.iter().all(|(_, e)| e.is_capacity_exceeded())
            }
            _ => self.inner().is_some_and(GatewayError::is_capacity_exceeded),
        }
    }

    /// Returns `true` if the error counts against the upstream's circuit breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        match self {
            Self::Upstream(e) => e.should_trip_breaker(),
            Self::EndpointRequestTimeout { .. } => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpstreamRateLimitRuleExceeded { retry_after, .. } => *retry_after,
            Self::Upstream(e) => e.retry_after(),
            Self::UpstreamsExhausted { errors, .. } => {
                errors.iter().filter_map(|(_, e)| e.retry_after()).min()
            }
            _ => self.inner().and_then(GatewayError::retry_after),
        }
    }

    /// HTTP status for a single (non-batch) response carrying this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidUrlPath(_) | Self::InvalidPattern(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::ProjectNotFound(_) | Self::NetworkNotFound(_) | Self::MethodNotFound(_) => 404,
            Self::RequestCanceled => 499,
            Self::RequestTimeout { .. } | Self::EndpointRequestTimeout { .. } => 504,
            Self::UpstreamRateLimitRuleExceeded { .. } => 429,
            Self::UpstreamSyncing { .. } |
            Self::UpstreamMethodIgnored { .. } |
            Self::UpstreamNotAllowed { .. } |
            Self::UpstreamNodeTypeMismatch { .. } |
            Self::CircuitBreakerOpen { .. } => 503,
            Self::Upstream(e) => {
                if self.is_capacity_exceeded() {
                    429
                } else if matches!(e, UpstreamError::Timeout) {
                    504
                } else if e.is_client_side() {
                    400
                } else {
                    502
                }
            }
            Self::UpstreamsExhausted { .. } => {
                if self.is_capacity_exceeded() {
                    429
                } else {
                    503
                }
            }
            Self::RateLimitBudgetNotFound { .. } |
            Self::UpstreamClientInitialization { .. } |
            Self::Internal(_) => 500,
            Self::UpstreamRequestSkipped { reason, .. } => reason.status_code(),
            Self::FailsafeRetryExceeded { cause, .. } => cause.status_code(),
            Self::UpstreamRequest(wrapped) => wrapped.cause.status_code(),
        }
    }

    /// JSON-RPC error code for the wire envelope.
    #[must_use]
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) |
            Self::InvalidUrlPath(_) |
            Self::ProjectNotFound(_) |
            Self::NetworkNotFound(_) => -32600,
            Self::MethodNotFound(_) | Self::UpstreamMethodIgnored { .. } => -32601,
            Self::InvalidPattern(_) => -32602,
            Self::Unauthorized(_) => -32016,
            Self::UpstreamNodeTypeMismatch { .. } => -32014,
            Self::UpstreamRateLimitRuleExceeded { .. } => -32005,
            Self::EndpointRequestTimeout { .. } | Self::RequestTimeout { .. } => -32015,
            Self::Upstream(e) => match e {
                UpstreamError::RpcError(code, ..) => *code,
                UpstreamError::CapacityExceeded { .. } | UpstreamError::HttpError(429, _) => -32005,
                UpstreamError::MissingData(_) => -32014,
                UpstreamError::InvalidRequest(_) => -32600,
                UpstreamError::Timeout => -32015,
                _ => -32603,
            },
            Self::UpstreamsExhausted { errors, .. } => {
                if self.is_capacity_exceeded() {
                    -32005
                } else if !errors.is_empty() &&
                    errors.iter().all(|(_, e)| {
                        matches!(e.root(), Self::UpstreamMethodIgnored { .. })
                    })
                {
                    -32601
                } else {
                    -32603
                }
            }
            Self::UpstreamRequestSkipped { reason, .. } => reason.json_rpc_code(),
            Self::FailsafeRetryExceeded { cause, .. } => cause.json_rpc_code(),
            Self::UpstreamRequest(wrapped) => wrapped.cause.json_rpc_code(),
            _ => -32603,
        }
    }

    /// The `error` object of a JSON-RPC error envelope.
    ///
    /// Upstream JSON-RPC errors keep their original message and `data`. Everything else carries the
    /// message of the outermost error so the client sees which layer gave up.
    #[must_use]
    pub fn error_body(&self) -> JsonRpcError {
        let (message, data) = match self.root() {
            Self::Upstream(UpstreamError::RpcError(_, message, data)) => (message.clone(), data.clone()),
            _ => match self {
                Self::UpstreamRequest(wrapped) => (wrapped.cause.to_string(), None),
                other => (other.to_string(), None),
            },
        };

        JsonRpcError { code: self.json_rpc_code(), message, data }
    }

    /// Per-call counters carried by this error, if any layer recorded them.
    #[must_use]
    pub fn counters(&self) -> Option<ExecutionCounters> {
        match self {
            Self::UpstreamRequest(wrapped) => Some(wrapped.counters),
            Self::UpstreamsExhausted { counters, .. } => Some(*counters),
            _ => None,
        }
    }

    /// Id of the upstream the error is attributed to, if any.
    #[must_use]
    pub fn upstream_id(&self) -> Option<&str> {
        match self {
            Self::UpstreamRequest(wrapped) => Some(&wrapped.upstream),
            Self::UpstreamRequestSkipped { upstream, .. } |
            Self::UpstreamSyncing { upstream } |
            Self::UpstreamMethodIgnored { upstream, .. } |
            Self::UpstreamNotAllowed { upstream } |
            Self::UpstreamNodeTypeMismatch { upstream, .. } |
            Self::UpstreamRateLimitRuleExceeded { upstream, .. } |
            Self::CircuitBreakerOpen { upstream } => Some(upstream),
            _ => None,
        }
    }
}
