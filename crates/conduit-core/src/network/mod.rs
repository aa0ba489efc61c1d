//! Networks and upstream failover.
//!
//! A [`Network`] owns the ordered upstream list of one chain within a project and the
//! head trackers their state pollers feed. [`Network::forward`] walks the list in order
//! and returns the first success. Exclusions (syncing, ignored method, stale full node)
//! are collected silently; real failures are collected and surfaced together once every
//! upstream has been tried.

pub mod state;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::{
    config::NetworkConfig,
    context::RequestContext,
    errors::GatewayError,
    resilience::ExecutionCounters,
    types::{NetworkArchitecture, NormalizedRequest, NormalizedResponse},
    upstream::Upstream,
};

pub use state::{BlockTracker, StatePoller};

pub struct Network {
    id: String,
    architecture: NetworkArchitecture,
    chain_id: u64,
    upstreams: Vec<Arc<Upstream>>,
    state_pollers: DashMap<String, Arc<dyn StatePoller>>,
}

impl Network {
    #[must_use]
    pub fn new(config: &NetworkConfig, upstreams: Vec<Arc<Upstream>>) -> Self {
        Self {
            id: config.network_id(),
            architecture: config.architecture,
            chain_id: config.chain_id,
            upstreams,
            state_pollers: DashMap::new(),
        }
    }

    /// Network id in `architecture:chain_id` form.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn architecture(&self) -> NetworkArchitecture {
        self.architecture
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[must_use]
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn register_state_poller(&self, upstream_id: &str, poller: Arc<dyn StatePoller>) {
        self.state_pollers.insert(upstream_id.to_string(), poller);
    }

    #[must_use]
    pub fn state_poller_of(&self, upstream_id: &str) -> Option<Arc<dyn StatePoller>> {
        self.state_pollers.get(upstream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Forwards `request` to the first upstream that serves it.
    ///
    /// Client-side failures are returned as soon as they occur since another upstream
    /// would reject the same request.
    ///
    /// # Errors
    ///
    /// - the caller's cause once `ctx` is cancelled or past its deadline
    /// - the first client-side error
    /// - [`GatewayError::UpstreamsExhausted`] with every per-upstream error otherwise
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, GatewayError> {
        let mut errors = Vec::new();
        let mut counters = ExecutionCounters::default();

        for upstream in &self.upstreams {
            if let Some(cause) = ctx.cause_if_done() {
                return Err(cause);
            }

            match upstream.forward(ctx, request, false).await {
                Ok(response) => {
                    if !errors.is_empty() {
                        debug!(network = %self.id, upstream = upstream.id(), failed = errors.len(), "request served after failover");
                    }
                    return Ok(response);
                }
                Err(err) if err.is_skip() => {
                    trace!(network = %self.id, upstream = upstream.id(), reason = %err, "upstream skipped");
                    errors.push((upstream.id().to_string(), err));
                }
                Err(err) if err.is_client_side() => return Err(err),
                Err(err) => {
                    debug!(network = %self.id, upstream = upstream.id(), error = %err, "upstream failed, trying next");
                    if let Some(c) = err.counters() {
                        counters += c;
                    }
                    errors.push((upstream.id().to_string(), err));
                }
            }
        }

        Err(GatewayError::UpstreamsExhausted { network: self.id.clone(), errors, counters })
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("upstreams", &self.upstreams.iter().map(|u| u.id()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
