//! In-process upstream transport with scripted behavior.

use async_trait::async_trait;
use conduit_core::{
    context::RequestContext,
    types::{ClientKind, NormalizedRequest, NormalizedResponse},
    upstream::{UpstreamError, UpstreamTransport},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

/// One scripted reply: an outcome delivered after an optional delay.
#[derive(Debug)]
pub struct Step {
    pub delay: Duration,
    pub outcome: Result<Value, UpstreamError>,
}

impl Step {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self { delay: Duration::ZERO, outcome: Ok(result) }
    }

    #[must_use]
    pub fn err(error: UpstreamError) -> Self {
        Self { delay: Duration::ZERO, outcome: Err(error) }
    }

    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Replays queued steps per method, then falls back to the method's fixed reply, then to
/// `"0x1"`.
///
/// A send whose future is dropped or whose context is cancelled before its delay elapses is
/// counted as cancelled.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fixed: Mutex<HashMap<String, (Value, Duration)>>,
    networks: Mutex<Vec<String>>,
    panicking: Mutex<Vec<String>>,
    calls: AtomicU32,
    calls_by_method: Mutex<HashMap<String, u32>>,
    completed: AtomicU32,
    cancelled: AtomicU32,
}

impl ScriptedTransport {
    /// A transport serving `evm:1`.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        transport.networks.lock().push("evm:1".to_string());
        Arc::new(transport)
    }

    /// Queues steps for `method`, consumed one per call.
    #[must_use]
    pub fn script(self: Arc<Self>, method: &str, steps: Vec<Step>) -> Arc<Self> {
        self.scripts.lock().entry(method.to_string()).or_default().extend(steps);
        self
    }

    /// Fixed reply once the script for `method` is exhausted.
    #[must_use]
    pub fn respond(self: Arc<Self>, method: &str, result: Value) -> Arc<Self> {
        self.respond_after(method, result, Duration::ZERO)
    }

    #[must_use]
    pub fn respond_after(self: Arc<Self>, method: &str, result: Value, delay: Duration) -> Arc<Self> {
        self.fixed.lock().insert(method.to_string(), (result, delay));
        self
    }

    /// Makes every send of `method` panic, as a buggy transport would.
    #[must_use]
    pub fn panic_on(self: Arc<Self>, method: &str) -> Arc<Self> {
        self.panicking.lock().push(method.to_string());
        self
    }

    /// Replaces the networks this transport reports as supported.
    #[must_use]
    pub fn serving(self: Arc<Self>, networks: &[&str]) -> Arc<Self> {
        *self.networks.lock() = networks.iter().map(|n| (*n).to_string()).collect();
        self
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn calls_for(&self, method: &str) -> u32 {
        self.calls_by_method.lock().get(method).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_step(&self, method: &str) -> Step {
        if let Some(step) = self.scripts.lock().get_mut(method).and_then(VecDeque::pop_front) {
            return step;
        }
        match self.fixed.lock().get(method) {
            Some((result, delay)) => Step::ok(result.clone()).after(*delay),
            None => Step::ok(json!("0x1")),
        }
    }
}

/// Counts a send as cancelled unless it reached the end.
struct InFlight<'a> {
    transport: &'a ScriptedTransport,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let counter =
            if self.finished { &self.transport.completed } else { &self.transport.cancelled };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    fn kind(&self) -> ClientKind {
        ClientKind::HttpJsonRpc
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, UpstreamError> {
        let method = request.method();
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_method.lock().entry(method.clone()).or_default() += 1;

        if self.panicking.lock().contains(&method) {
            panic!("scripted transport panicked on {method}");
        }

        let step = self.next_step(&method);
        let mut in_flight = InFlight { transport: self, finished: false };

        if !step.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(step.delay) => {}
                () = ctx.token().cancelled() => {
                    return Err(UpstreamError::ConnectionFailed("request cancelled".to_string()));
                }
            }
        }

        in_flight.finished = true;
        step.outcome.map(NormalizedResponse::from_result)
    }

    async fn supports_network(
        &self,
        _ctx: &RequestContext,
        network_id: &str,
    ) -> Result<bool, UpstreamError> {
        Ok(self.networks.lock().iter().any(|n| n == network_id))
    }
}
