//! Canonical JSON-RPC envelopes for every outcome.
//!
//! Successes echo the upstream payload with the inbound `jsonrpc` and `id`. Failures become
//! `{jsonrpc, id, error: {code, message, data}}`; the original [`GatewayError`] is kept
//! alongside for logging and status mapping but never serialized.

use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::{
    errors::GatewayError,
    types::{NormalizedResponse, ResponseMetadata, JSONRPC_VERSION},
};

/// The normalized result of one request item.
#[derive(Debug)]
pub struct NormalizedOutcome {
    pub body: Value,
    pub metadata: ResponseMetadata,
    /// HTTP status this outcome would have as a singleton response.
    pub status: u16,
    pub error: Option<GatewayError>,
}

impl NormalizedOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Builds the success envelope and releases the response buffer.
///
/// A payload that cannot be parsed is reported as an internal error, since the transport
/// already validated it once.
#[must_use]
pub fn normalize_success(id: &Value, response: &NormalizedResponse) -> NormalizedOutcome {
    let metadata = response.metadata();
    let body = response.json().and_then(Value::as_object).map(|payload| {
        let mut envelope = Map::with_capacity(payload.len() + 2);
        envelope.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        envelope.insert("id".to_string(), id.clone());
        for (key, value) in payload {
            if key != "jsonrpc" && key != "id" {
                envelope.insert(key.clone(), value.clone());
            }
        }
        Value::Object(envelope)
    });
    response.release();

    match body {
        Some(body) => NormalizedOutcome { body, metadata, status: 200, error: None },
        None => {
            let mut outcome = normalize_error(
                id,
                GatewayError::Internal("upstream payload is no longer readable".to_string()),
            );
            outcome.metadata = metadata;
            outcome
        }
    }
}

/// Builds the error envelope and logs the failure at a severity matching its class.
#[must_use]
pub fn normalize_error(id: &Value, err: GatewayError) -> NormalizedOutcome {
    if err.is_client_side() {
        debug!(code_chain = %err.code_chain(), error = %err, "request failed");
    } else {
        error!(code_chain = %err.code_chain(), cause = %err.deepest_message(), "request failed");
    }

    let error_body = err.error_body();
    let body = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error_body,
    });

    let metadata = ResponseMetadata {
        from_cache: false,
        upstream: err.upstream_id().map(Into::into),
        attempts: err.counters().map_or(0, |c| c.attempts),
        retries: err.counters().map_or(0, |c| c.retries),
        hedges: err.counters().map_or(0, |c| c.hedges),
    };

    NormalizedOutcome { body, metadata, status: err.status_code(), error: Some(err) }
}

/// Outcome for an item whose worker panicked.
#[must_use]
pub fn internal_failure(id: &Value, reason: &str) -> NormalizedOutcome {
    normalize_error(id, GatewayError::Internal(reason.to_string()))
}
