use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, time::interval};
use tracing::{debug, info, warn};

use crate::{
    context::RequestContext,
    errors::GatewayError,
    metrics::MetricsCollector,
    network::BlockTracker,
    types::{EvmSyncingState, JsonRpcRequest, NormalizedRequest},
    upstream::{errors::UpstreamError, Upstream},
    utils::block_param::BlockParameter,
};

/// Bound on a single probe so a hung node cannot stall the poll loop.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodically refreshes an EVM upstream's head block and syncing state.
///
/// Probes go through [`Upstream::forward`] with the eligibility filter bypassed, so they
/// still honor the rate budget and the resilience pipeline.
pub struct EvmStatePoller {
    upstream: Arc<Upstream>,
    tracker: Arc<BlockTracker>,
    interval: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl EvmStatePoller {
    #[must_use]
    pub fn new(upstream: Arc<Upstream>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let interval = Duration::from_millis(upstream.config().evm.state_poller_interval_ms.max(1));
        Self { upstream, tracker: Arc::new(BlockTracker::new()), interval, metrics }
    }

    #[must_use]
    pub fn upstream_id(&self) -> &str {
        self.upstream.id()
    }

    /// The tracker this poller writes. Register it with the network as the upstream's
    /// [`StatePoller`](crate::network::StatePoller).
    #[must_use]
    pub fn tracker(&self) -> Arc<BlockTracker> {
        Arc::clone(&self.tracker)
    }

    /// Runs both probes once. A failing probe does not prevent the other.
    pub async fn poll_once(&self) {
        let ctx = RequestContext::with_timeout(PROBE_TIMEOUT);

        match self.poll_latest_block(&ctx).await {
            Ok(block) => {
                self.tracker.update(block);
                if let Some(metrics) = &self.metrics {
                    metrics.record_upstream_block_head(self.upstream.id(), block);
                }
            }
            Err(e) => warn!(upstream = self.upstream.id(), error = %e, "failed to poll latest block"),
        }

        match self.poll_syncing(&ctx).await {
            Ok(state) => self.upstream.set_syncing_state(state),
            Err(e) => debug!(upstream = self.upstream.id(), error = %e, "failed to poll syncing state"),
        }
    }

    async fn probe(&self, ctx: &RequestContext, method: &str) -> Result<Value, GatewayError> {
        let request = NormalizedRequest::new(JsonRpcRequest::new(method, Some(json!([])), json!(1)));
        let response = self.upstream.forward(ctx, &request, true).await?;
        let result = response.result().cloned();
        response.release();
        result.ok_or_else(|| UpstreamError::InvalidResponse(format!("{method} returned no result")).into())
    }

    async fn poll_latest_block(&self, ctx: &RequestContext) -> Result<u64, GatewayError> {
        let result = self.probe(ctx, "eth_blockNumber").await?;
        result.as_str().and_then(BlockParameter::parse_hex).ok_or_else(|| {
            UpstreamError::InvalidResponse(format!("eth_blockNumber returned {result}")).into()
        })
    }

    /// `false` means synced. Any syncing progress object means the node is catching up.
    async fn poll_syncing(&self, ctx: &RequestContext) -> Result<EvmSyncingState, GatewayError> {
        match self.probe(ctx, "eth_syncing").await? {
            Value::Bool(false) => Ok(EvmSyncingState::NotSyncing),
            Value::Bool(true) | Value::Object(_) => Ok(EvmSyncingState::Syncing),
            other => Err(UpstreamError::InvalidResponse(format!("eth_syncing returned {other}")).into()),
        }
    }

    pub fn start_with_shutdown(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(upstream = self.upstream.id(), "state poller shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for EvmStatePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmStatePoller")
            .field("upstream", &self.upstream.id())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
