use std::time::Duration;

use thiserror::Error;

/// Classification of JSON-RPC errors returned by upstream nodes.
///
/// The category decides how the engine reacts:
/// - Client and execution errors are forwarded without penalizing the upstream
/// - Provider and parse errors count as upstream failures (breaker, retries)
/// - Rate limits feed the auto-tuner and are retried with backoff
/// - Missing data means the node is behind or pruned, not broken
/// - Unsupported methods may be added to the upstream's ignore list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCategory {
    /// Invalid request or invalid params.
    ClientError,
    /// Method not found (-32601).
    MethodNotSupported,
    /// Internal error, server error.
    ProviderError,
    /// Limit exceeded (-32005).
    RateLimit,
    /// Parse error from upstream.
    ParseError,
    /// Reverts, out of gas, nonce issues.
    ExecutionError,
    /// Node does not have the requested state (pruned or not yet synced).
    MissingData,
}

impl RpcErrorCategory {
    /// Classifies a JSON-RPC error code and message into a category.
    ///
    /// The -32000..=-32099 server range is ambiguous across node implementations, so the
    /// message is inspected for execution and missing-data markers.
    #[must_use]
    pub fn from_code_and_message(code: i32, message: &str) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32601 => Self::MethodNotSupported,
            -32600 | -32602 => Self::ClientError,
            -32603 => Self::ProviderError,
            -32005 => Self::RateLimit,
            -32014 => Self::MissingData,
            -32099..=-32000 => {
                let message_lower = message.to_lowercase();
                if message_lower.contains("execution reverted") ||
                    message_lower.contains("out of gas") ||
                    message_lower.contains("revert") ||
                    message_lower.contains("insufficient funds") ||
                    message_lower.contains("nonce too low") ||
                    message_lower.contains("gas too low")
                {
                    Self::ExecutionError
                } else if message_lower.contains("missing trie node") ||
                    message_lower.contains("header not found") ||
                    message_lower.contains("unknown block") ||
                    message_lower.contains("state is not available") ||
                    message_lower.contains("pruned")
                {
                    Self::MissingData
                } else if message_lower.contains("rate limit") ||
                    message_lower.contains("too many requests")
                {
                    Self::RateLimit
                } else if message_lower.contains("method not found") ||
                    message_lower.contains("not supported") ||
                    message_lower.contains("does not exist/is not available")
                {
                    Self::MethodNotSupported
                } else {
                    Self::ProviderError
                }
            }
            3 => Self::ExecutionError,
            _ => Self::ProviderError,
        }
    }

    /// Returns `true` if retrying (possibly on another upstream) can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError | Self::MissingData)
    }

    /// Returns `true` if the error counts against the upstream's circuit breaker.
    #[must_use]
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(self, Self::ProviderError | Self::ParseError)
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::MethodNotSupported => "method_not_supported",
            Self::ProviderError => "provider_error",
            Self::RateLimit => "rate_limit",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
            Self::MissingData => "missing_data",
        }
    }
}

/// Errors produced by an upstream transport for a single send.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The transport gave up waiting for the upstream.
    #[error("Request timeout")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx HTTP status. First field is the status code.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error object returned by the upstream: code, message and the optional
    /// `data` member (revert payloads and the like), kept verbatim for the client.
    #[error("RPC error {0}: {1}")]
    RpcError(i32, String, Option<serde_json::Value>),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The upstream (or its provider) is rate limiting us.
    #[error("Upstream capacity exceeded: {message}")]
    CapacityExceeded { message: String, retry_after: Option<Duration> },

    /// The upstream does not have the requested data.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// The transport declined to send the request at all.
    #[error("Request skipped by transport: {0}")]
    Skipped(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Maximum concurrent requests limit has been reached.
    #[error("Concurrency limit reached: {0}")]
    ConcurrencyLimit(String),
}

impl UpstreamError {
    /// JSON-RPC error without a `data` member.
    #[must_use]
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::RpcError(code, message.into(), None)
    }

    /// Returns the RPC error category if this is an RPC error.
    #[must_use]
    pub fn rpc_category(&self) -> Option<RpcErrorCategory> {
        match self {
            Self::RpcError(code, message, _) => {
                Some(RpcErrorCategory::from_code_and_message(*code, message))
            }
            Self::CapacityExceeded { .. } => Some(RpcErrorCategory::RateLimit),
            Self::MissingData(_) => Some(RpcErrorCategory::MissingData),
            _ => None,
        }
    }

    /// Returns `true` if the error is transient and the request may be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout |
            Self::Network(_) |
            Self::ConnectionFailed(_) |
            Self::ConcurrencyLimit(_) |
            Self::CapacityExceeded { .. } |
            Self::MissingData(_) => true,
            Self::HttpError(status, _) => (500..=599).contains(status) || *status == 429,
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| cat.is_transient()),
            _ => false,
        }
    }

    /// Returns `true` if retrying won't help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::InvalidRequest(_) | Self::Skipped(_) => true,
            Self::HttpError(status, _) => (400..=499).contains(status) && *status != 429,
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| !cat.is_transient()),
            _ => false,
        }
    }

    /// Returns `true` if the error was caused by the client's request rather than the upstream.
    #[must_use]
    pub fn is_client_side(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => true,
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| {
                matches!(cat, RpcErrorCategory::ClientError | RpcErrorCategory::ExecutionError)
            }),
            _ => false,
        }
    }

    /// Returns `true` if the error should count as a failure in the circuit breaker window.
    ///
    /// Rate limits, missing data, skips and client errors say nothing about the health of
    /// the upstream.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        match self {
            Self::Timeout |
            Self::Network(_) |
            Self::ConnectionFailed(_) |
            Self::InvalidResponse(_) => true,
            Self::HttpError(status, _) => (500..=599).contains(status),
            Self::RpcError(..) => {
                self.rpc_category().is_some_and(|cat| cat.should_trigger_circuit_breaker())
            }
            _ => false,
        }
    }

    /// Returns `true` for "method not found" style errors.
    #[must_use]
    pub fn is_method_not_supported(&self) -> bool {
        self.rpc_category() == Some(RpcErrorCategory::MethodNotSupported)
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CapacityExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable short code used in error chains and metric labels.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "ErrEndpointTransportTimeout",
            Self::ConnectionFailed(_) | Self::Network(_) => "ErrEndpointTransportFailure",
            Self::HttpError(..) => "ErrEndpointServerSideException",
            Self::RpcError(..) => match self.rpc_category() {
                Some(RpcErrorCategory::ClientError) => "ErrEndpointClientSideException",
                Some(RpcErrorCategory::ExecutionError) => "ErrEndpointExecutionException",
                Some(RpcErrorCategory::MethodNotSupported) => "ErrEndpointUnsupported",
                Some(RpcErrorCategory::RateLimit) => "ErrEndpointCapacityExceeded",
                Some(RpcErrorCategory::MissingData) => "ErrEndpointMissingData",
                _ => "ErrEndpointServerSideException",
            },
            Self::InvalidResponse(_) => "ErrEndpointInvalidResponse",
            Self::CapacityExceeded { .. } => "ErrEndpointCapacityExceeded",
            Self::MissingData(_) => "ErrEndpointMissingData",
            Self::Skipped(_) => "ErrEndpointRequestSkipped",
            Self::InvalidRequest(_) => "ErrEndpointClientSideException",
            Self::ConcurrencyLimit(_) => "ErrEndpointConcurrencyLimit",
        }
    }
}
