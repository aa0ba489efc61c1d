//! In-crate transport double for unit tests.

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    context::RequestContext,
    types::{ClientKind, NormalizedRequest, NormalizedResponse},
    upstream::{errors::UpstreamError, transport::UpstreamTransport},
};

/// Replays scripted outcomes in order, then answers `"0x1"`. Methods registered with
/// [`answer`](Self::answer) always get their fixed result.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    fixed: Mutex<AHashMap<String, Value>>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn with(outcomes: Vec<Result<Value, UpstreamError>>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(outcomes.into()), ..Self::default() })
    }

    pub fn answer(self: &Arc<Self>, method: &str, result: Value) -> Arc<Self> {
        self.fixed.lock().insert(method.to_string(), result);
        Arc::clone(self)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    fn kind(&self) -> ClientKind {
        ClientKind::HttpJsonRpc
    }

    async fn send(
        &self,
        _ctx: &RequestContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.fixed.lock().get(&request.method()) {
            return Ok(NormalizedResponse::from_result(result.clone()));
        }
        let next = self.script.lock().pop_front().unwrap_or_else(|| Ok(json!("0x1")));
        next.map(NormalizedResponse::from_result)
    }

    async fn supports_network(
        &self,
        _ctx: &RequestContext,
        network_id: &str,
    ) -> Result<bool, UpstreamError> {
        Ok(network_id == "evm:1")
    }
}
