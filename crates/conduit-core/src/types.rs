//! Core type definitions: JSON-RPC wire types, normalized requests and responses, and the
//! small enums shared by configuration and runtime state.
//!
//! # Type Categories
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcError`]: protocol conformance
//! - [`CacheStatus`]: gateway extension reported in the `X-Conduit-Cache` header
//!
//! ## Normalized Types
//! - [`NormalizedRequest`]: a decoded request plus directives, resolved network and the
//!   bookkeeping the engine needs while forwarding it
//! - [`NormalizedResponse`]: an upstream payload held in a pooled buffer, parsed lazily,
//!   with [`ResponseMetadata`] attached
//!
//! # Ownership Notes
//!
//! A request never owns an upstream. It records the id of the last upstream attempted and
//! the last valid response; the response keeps its buffer alive until it is released or
//! the last handle is dropped.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    borrow::Cow,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use crate::{
    errors::GatewayError,
    network::Network,
    utils::{block_param::BlockParameter, buffer_pool::PooledBuffer},
};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Whether a response was served from cache.
///
/// ```
/// use conduit_core::types::CacheStatus;
///
/// assert_eq!(CacheStatus::Miss.to_string(), "MISS");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Hit => write!(f, "HIT"),
            CacheStatus::Miss => write!(f, "MISS"),
        }
    }
}

/// JSON-RPC 2.0 request.
///
/// `params` and `id` are optional on the wire; a missing id decodes as `null`.
///
/// ```
/// use conduit_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_blockNumber", None, json!(1));
/// assert_eq!(request.method, "eth_blockNumber");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc_version")]
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default = "default_request_id")]
    pub id: Arc<Value>,
    /// Gateway extension naming the target network when the URL does not. Never forwarded.
    #[serde(rename = "networkId", default, skip_serializing)]
    pub network_id: Option<String>,
}

fn default_jsonrpc_version() -> Cow<'static, str> {
    JSONRPC_VERSION_COW
}

fn default_request_id() -> Arc<Value> {
    Arc::new(Value::Null)
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            method: method.into(),
            params,
            id: Arc::new(id),
            network_id: None,
        }
    }
}

/// JSON-RPC 2.0 error object.
///
/// Standard codes: `-32700` parse error, `-32600` invalid request, `-32601` method not
/// found, `-32602` invalid params, `-32603` internal error. The gateway adds `-32005`
/// (capacity), `-32014` (missing data), `-32015` (timeout) and `-32016` (unauthorized).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Chain architecture of a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkArchitecture {
    #[default]
    Evm,
}

impl fmt::Display for NetworkArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkArchitecture::Evm => write!(f, "evm"),
        }
    }
}

impl FromStr for NetworkArchitecture {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(NetworkArchitecture::Evm),
            other => Err(GatewayError::InvalidUrlPath(format!("unsupported architecture: {other}"))),
        }
    }
}

/// Kind of node behind an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamType {
    #[default]
    Evm,
    Solana,
}

impl fmt::Display for UpstreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamType::Evm => write!(f, "evm"),
            UpstreamType::Solana => write!(f, "solana"),
        }
    }
}

/// Wire protocol spoken by an upstream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    HttpJsonRpc,
    Grpc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvmNodeType {
    #[default]
    Unknown,
    Full,
    Archive,
}

impl fmt::Display for EvmNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvmNodeType::Unknown => write!(f, "unknown"),
            EvmNodeType::Full => write!(f, "full"),
            EvmNodeType::Archive => write!(f, "archive"),
        }
    }
}

/// Syncing state of an EVM upstream. `Unknown` is treated as "may be syncing" when
/// deciding whether empty results deserve a retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum EvmSyncingState {
    #[default]
    Unknown,
    Syncing,
    NotSyncing,
}

impl EvmSyncingState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EvmSyncingState::Unknown => "unknown",
            EvmSyncingState::Syncing => "syncing",
            EvmSyncingState::NotSyncing => "not_syncing",
        }
    }

    #[must_use]
    pub fn from_flag(syncing: Option<bool>) -> Self {
        match syncing {
            Some(true) => EvmSyncingState::Syncing,
            Some(false) => EvmSyncingState::NotSyncing,
            None => EvmSyncingState::Unknown,
        }
    }
}

/// Per-request directives supplied through headers or query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDirectives {
    /// Wildcard pattern restricting which upstream ids may serve the request.
    pub use_upstream: Option<String>,
    /// Retry emptyish results on upstreams that may still be syncing.
    pub retry_empty: bool,
}

impl Default for RequestDirectives {
    fn default() -> Self {
        Self { use_upstream: None, retry_empty: true }
    }
}

/// A decoded inbound request as seen by the engine.
///
/// The JSON-RPC body sits behind a lock because architecture-specific normalization
/// rewrites parameters in place, once, the first time the request is prepared for an
/// upstream.
#[derive(Debug)]
pub struct NormalizedRequest {
    raw: Bytes,
    rpc: RwLock<JsonRpcRequest>,
    prepared: AtomicBool,
    directives: RwLock<RequestDirectives>,
    network: OnceLock<Arc<Network>>,
    last_upstream: RwLock<Option<Arc<str>>>,
    last_valid_response: RwLock<Option<NormalizedResponse>>,
}

impl NormalizedRequest {
    /// Wraps an already decoded request.
    #[must_use]
    pub fn new(request: JsonRpcRequest) -> Self {
        let raw = serde_json::to_vec(&request).map(Bytes::from).unwrap_or_default();
        Self::from_parts(raw, request)
    }

    /// Decodes a single JSON-RPC request.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the body is not a JSON-RPC request object.
    pub fn from_bytes(raw: Bytes) -> Result<Self, GatewayError> {
        let request: JsonRpcRequest = serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::InvalidRequest(format!("failed to decode request: {e}")))?;
        Self::validate(&request)?;
        Ok(Self::from_parts(raw, request))
    }

    /// Decodes one item of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the item is not a JSON-RPC request object.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let raw = serde_json::to_vec(&value).map(Bytes::from).unwrap_or_default();
        let request: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| GatewayError::InvalidRequest(format!("failed to decode request: {e}")))?;
        Self::validate(&request)?;
        Ok(Self::from_parts(raw, request))
    }

    fn validate(request: &JsonRpcRequest) -> Result<(), GatewayError> {
        if request.method.is_empty() {
            return Err(GatewayError::InvalidRequest("method is required".to_string()));
        }
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported jsonrpc version: {}",
                request.jsonrpc
            )));
        }
        Ok(())
    }

    fn from_parts(raw: Bytes, request: JsonRpcRequest) -> Self {
        Self {
            raw,
            rpc: RwLock::new(request),
            prepared: AtomicBool::new(false),
            directives: RwLock::new(RequestDirectives::default()),
            network: OnceLock::new(),
            last_upstream: RwLock::new(None),
            last_valid_response: RwLock::new(None),
        }
    }

    /// The body exactly as received.
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    #[must_use]
    pub fn json_rpc(&self) -> RwLockReadGuard<'_, JsonRpcRequest> {
        self.rpc.read()
    }

    #[must_use]
    pub fn method(&self) -> String {
        self.rpc.read().method.clone()
    }

    #[must_use]
    pub fn id(&self) -> Arc<Value> {
        Arc::clone(&self.rpc.read().id)
    }

    /// Network named by the `networkId` member of the request body, if any.
    #[must_use]
    pub fn body_network_id(&self) -> Option<String> {
        self.rpc.read().network_id.clone()
    }

    /// Serialized body to send upstream, reflecting any normalization applied.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if serialization fails.
    pub fn body_for_upstream(&self) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(&*self.rpc.read())
            .map_err(|e| GatewayError::Internal(format!("failed to encode request: {e}")))
    }

    /// Canonicalizes EVM hex quantities in the block parameter. Runs at most once.
    pub fn normalize_evm_params(&self) {
        if self.prepared.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut rpc = self.rpc.write();
        let JsonRpcRequest { method, params, .. } = &mut *rpc;
        if let Some(params) = params.as_mut() {
            BlockParameter::normalize_request_params(method, params);
        }
    }

    #[must_use]
    pub fn directives(&self) -> RequestDirectives {
        self.directives.read().clone()
    }

    pub fn set_directives(&self, directives: RequestDirectives) {
        *self.directives.write() = directives;
    }

    /// Attaches the resolved network. Only the first call has an effect.
    pub fn set_network(&self, network: Arc<Network>) {
        let _ = self.network.set(network);
    }

    #[must_use]
    pub fn network(&self) -> Option<&Arc<Network>> {
        self.network.get()
    }

    #[must_use]
    pub fn network_id(&self) -> String {
        self.network.get().map_or_else(|| "n/a".to_string(), |n| n.id().to_string())
    }

    pub fn set_last_upstream(&self, upstream_id: Arc<str>) {
        *self.last_upstream.write() = Some(upstream_id);
    }

    #[must_use]
    pub fn last_upstream(&self) -> Option<Arc<str>> {
        self.last_upstream.read().clone()
    }

    pub fn set_last_valid_response(&self, response: NormalizedResponse) {
        *self.last_valid_response.write() = Some(response);
    }

    #[must_use]
    pub fn last_valid_response(&self) -> Option<NormalizedResponse> {
        self.last_valid_response.read().clone()
    }
}

/// Observability metadata attached to every outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMetadata {
    pub from_cache: bool,
    pub upstream: Option<Arc<str>>,
    pub attempts: u32,
    pub retries: u32,
    pub hedges: u32,
}

impl ResponseMetadata {
    #[must_use]
    pub fn cache_status(&self) -> CacheStatus {
        if self.from_cache {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }
}

#[derive(Debug)]
struct ResponseInner {
    body: Mutex<Option<PooledBuffer>>,
    parsed: OnceLock<Option<Value>>,
    metadata: RwLock<ResponseMetadata>,
}

/// A successful upstream payload.
///
/// Cloning is cheap and shares the underlying buffer. The buffer goes back to its pool
/// on [`release`](Self::release) or when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    inner: Arc<ResponseInner>,
}

impl NormalizedResponse {
    /// Wraps a pooled buffer holding a full JSON-RPC response body.
    #[must_use]
    pub fn from_buffer(buffer: PooledBuffer) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                body: Mutex::new(Some(buffer)),
                parsed: OnceLock::new(),
                metadata: RwLock::new(ResponseMetadata::default()),
            }),
        }
    }

    /// Builds a response around an already parsed `result` value.
    #[must_use]
    pub fn from_result(result: Value) -> Self {
        let parsed = OnceLock::new();
        let _ = parsed.set(Some(serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "result": result })));
        Self {
            inner: Arc::new(ResponseInner {
                body: Mutex::new(None),
                parsed,
                metadata: RwLock::new(ResponseMetadata::default()),
            }),
        }
    }

    /// The parsed body, decoded from the buffer on first access.
    ///
    /// Returns `None` if the body is not valid JSON, or if the buffer was released before
    /// it was ever parsed.
    #[must_use]
    pub fn json(&self) -> Option<&Value> {
        self.inner
            .parsed
            .get_or_init(|| {
                let body = self.inner.body.lock();
                body.as_ref().and_then(|buf| serde_json::from_slice(buf.as_slice()).ok())
            })
            .as_ref()
    }

    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.json().and_then(|v| v.get("result"))
    }

    /// Returns `true` for results that carry no data: `null`, `"0x"`, `""`, `[]` or `{}`.
    #[must_use]
    pub fn is_result_emptyish(&self) -> bool {
        match self.result() {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty() || s == "0x",
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Object(o)) => o.is_empty(),
            Some(_) => false,
        }
    }

    /// Parses the body and returns the buffer to its pool. Parsed data stays available.
    pub fn release(&self) {
        let _ = self.json();
        self.inner.body.lock().take();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.body.lock().is_none()
    }

    #[must_use]
    pub fn metadata(&self) -> ResponseMetadata {
        self.inner.metadata.read().clone()
    }

    pub fn set_metadata(&self, metadata: ResponseMetadata) {
        *self.inner.metadata.write() = metadata;
    }

    pub fn set_from_cache(&self, from_cache: bool) {
        self.inner.metadata.write().from_cache = from_cache;
    }
}
