use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, ClientBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::{
    context::RequestContext,
    types::{ClientKind, JsonRpcRequest, NormalizedRequest, NormalizedResponse},
    upstream::{errors::UpstreamError, transport::UpstreamTransport},
    utils::{block_param::BlockParameter, buffer_pool::BufferPool},
};

const ERROR_BODY_PREVIEW: usize = 256;
const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// JSON-RPC over HTTP POST, with a per-upstream concurrency limit.
pub struct HttpJsonRpcTransport {
    upstream_id: String,
    endpoint: Url,
    client: Client,
    concurrency: Arc<Semaphore>,
    buffers: Arc<BufferPool>,
    max_response_bytes: usize,
}

impl HttpJsonRpcTransport {
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] for an endpoint that is not an http(s) URL
    /// and [`UpstreamError::ConnectionFailed`] if the HTTP client cannot be built.
    pub fn new(
        upstream_id: impl Into<String>,
        endpoint: &str,
        max_concurrent_requests: usize,
        buffers: Arc<BufferPool>,
    ) -> Result<Self, UpstreamError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid endpoint url: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(UpstreamError::InvalidRequest(format!(
                "unsupported endpoint scheme: {}",
                endpoint.scheme()
            )));
        }

        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(5))
            // last-resort bound only, deadlines are enforced by the resilience pipeline
            .timeout(Duration::from_secs(120))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            upstream_id: upstream_id.into(),
            endpoint,
            client,
            concurrency: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            buffers,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        })
    }

    #[must_use]
    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes.max(1);
        self
    }

    fn oversized(&self) -> UpstreamError {
        tracing::warn!(upstream = %self.upstream_id, limit = self.max_response_bytes, "upstream response too large");
        UpstreamError::InvalidResponse(format!(
            "response body exceeds {} bytes",
            self.max_response_bytes
        ))
    }

    /// Sanitizes network errors so endpoint URLs (which often embed API keys) never leak.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_redirect() {
            "too many redirects".to_string()
        } else {
            "network error".to_string()
        }
    }

    fn map_send_error(error: &reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::ConnectionFailed(Self::sanitize_network_error(error))
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, UpstreamError> {
        Arc::clone(&self.concurrency).acquire_owned().await.map_err(|_| {
            tracing::warn!(upstream = %self.upstream_id, "http transport semaphore closed");
            UpstreamError::ConcurrencyLimit(self.upstream_id.clone())
        })
    }

    fn retry_after(response: &Response) -> Option<Duration> {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Maps a JSON-RPC error object onto the transport error taxonomy.
    fn classify_rpc_error(error: &Value, retry_after: Option<Duration>) -> UpstreamError {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(-32603);
        let message = error.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let data = error.get("data").filter(|d| !d.is_null()).cloned();

        if code == -32005 {
            UpstreamError::CapacityExceeded { message, retry_after }
        } else {
            UpstreamError::RpcError(code, message, data)
        }
    }

    fn preview(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        if text.len() > ERROR_BODY_PREVIEW {
            let mut end = ERROR_BODY_PREVIEW;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated)", &text[..end])
        } else {
            text.into_owned()
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<NormalizedResponse, UpstreamError> {
        let _permit = self.acquire_permit().await?;

        let mut response = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&e))?;

        let status = response.status();
        let retry_after = Self::retry_after(&response);

        if response.content_length().is_some_and(|len| len > self.max_response_bytes as u64) {
            return Err(self.oversized());
        }

        let mut buffer = self.buffers.acquire();
        while let Some(chunk) = response.chunk().await.map_err(|e| Self::map_send_error(&e))? {
            if buffer.len() + chunk.len() > self.max_response_bytes {
                return Err(self.oversized());
            }
            buffer.extend_from_slice(&chunk);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::CapacityExceeded {
                message: Self::preview(buffer.as_slice()),
                retry_after,
            });
        }

        let response = NormalizedResponse::from_buffer(buffer);
        let Some(parsed) = response.json() else {
            return Err(if status.is_success() {
                UpstreamError::InvalidResponse("response body is not valid JSON".to_string())
            } else {
                UpstreamError::HttpError(status.as_u16(), "non-JSON error response".to_string())
            });
        };

        if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
            return Err(Self::classify_rpc_error(error, retry_after));
        }
        if !status.is_success() {
            return Err(UpstreamError::HttpError(status.as_u16(), parsed.to_string()));
        }
        if parsed.get("result").is_none() {
            return Err(UpstreamError::InvalidResponse(
                "response has neither result nor error".to_string(),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl UpstreamTransport for HttpJsonRpcTransport {
    fn kind(&self) -> ClientKind {
        ClientKind::HttpJsonRpc
    }

    async fn send(
        &self,
        _ctx: &RequestContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, UpstreamError> {
        let body = request
            .body_for_upstream()
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        tracing::trace!(upstream = %self.upstream_id, method = %request.method(), "sending http json-rpc request");
        self.post(body).await
    }

    async fn supports_network(
        &self,
        ctx: &RequestContext,
        network_id: &str,
    ) -> Result<bool, UpstreamError> {
        let Some(chain_id) = network_id.strip_prefix("evm:") else {
            return Ok(false);
        };

        let probe = NormalizedRequest::new(JsonRpcRequest::new("eth_chainId", Some(json!([])), json!(75412)));
        let response = self.send(ctx, &probe).await?;
        let reported = response
            .result()
            .and_then(Value::as_str)
            .and_then(BlockParameter::parse_hex)
            .ok_or_else(|| UpstreamError::InvalidResponse("eth_chainId returned no quantity".to_string()))?;

        Ok(reported.to_string() == chain_id)
    }
}

impl std::fmt::Debug for HttpJsonRpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonRpcTransport")
            .field("upstream_id", &self.upstream_id)
            .field("host", &self.endpoint.host_str())
            .field("available_permits", &self.concurrency.available_permits())
            .finish_non_exhaustive()
    }
}
