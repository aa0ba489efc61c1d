use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use tracing::{debug, trace};

use crate::{
    config::{ScoreMultiplierConfig, UpstreamConfig},
    context::RequestContext,
    errors::{GatewayError, UpstreamRequestError},
    metrics::MetricsCollector,
    rate_limit::{RateLimitAutoTuner, RateLimitersRegistry},
    resilience::{CircuitBreakerState, ExecutionOptions, ExecutionState, ResiliencePipeline},
    types::{
        ClientKind, EvmNodeType, EvmSyncingState, JsonRpcRequest, NormalizedRequest,
        NormalizedResponse, ResponseMetadata, UpstreamType,
    },
    upstream::{errors::UpstreamError, transport::UpstreamTransport},
    utils::{block_param::BlockParameter, wildcard::wildcard_match},
};

/// Recent-block window assumed for full nodes that do not configure one.
pub const DEFAULT_FULL_NODE_RECENT_BLOCKS: u64 = 128;

/// One configured upstream node and all of its runtime state.
///
/// The config sits in an [`ArcSwap`] because `ignore_method` and feature detection update
/// it at runtime while requests keep reading it lock-free.
pub struct Upstream {
    id: Arc<str>,
    project_id: String,
    config: ArcSwap<UpstreamConfig>,
    transport: Arc<dyn UpstreamTransport>,
    pipeline: ResiliencePipeline,
    rate_limiters: Arc<RateLimitersRegistry>,
    auto_tuner: Option<Arc<RateLimitAutoTuner>>,
    metrics: Option<Arc<MetricsCollector>>,
    /// Memoized method eligibility. Entries are only evicted by `ignore_method`.
    method_memo: RwLock<AHashMap<String, bool>>,
    supported_networks: RwLock<AHashMap<String, bool>>,
    syncing: RwLock<EvmSyncingState>,
}

/// Snapshot served by the admin API and the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub id: String,
    pub syncing: EvmSyncingState,
    pub circuit_breaker: Option<&'static str>,
    pub rate_limit_budget: Option<String>,
    pub active_networks: Vec<String>,
}

impl Upstream {
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimitBudgetNotFound`] if the configured budget does not
    /// exist.
    pub fn new(
        project_id: impl Into<String>,
        config: UpstreamConfig,
        transport: Arc<dyn UpstreamTransport>,
        rate_limiters: Arc<RateLimitersRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self, GatewayError> {
        let auto_tuner = match &config.rate_limit_budget {
            Some(budget_id) => {
                let budget = rate_limiters.get_budget(budget_id)?;
                config.rate_limit_auto_tune.enabled.then(|| {
                    Arc::new(RateLimitAutoTuner::new(
                        config.id.clone(),
                        budget,
                        config.rate_limit_auto_tune.clone(),
                        metrics.clone(),
                    ))
                })
            }
            None => None,
        };

        let mut supported_networks = AHashMap::new();
        if let Some(chain_id) = config.evm.chain_id {
            supported_networks.insert(format!("evm:{chain_id}"), true);
        }

        let syncing = EvmSyncingState::from_flag(config.evm.syncing);
        let pipeline = ResiliencePipeline::from_config(&config.id, &config.failsafe, metrics.clone());

        Ok(Self {
            id: Arc::from(config.id.as_str()),
            project_id: project_id.into(),
            config: ArcSwap::from_pointee(config),
            transport,
            pipeline,
            rate_limiters,
            auto_tuner,
            metrics,
            method_memo: RwLock::new(AHashMap::new()),
            supported_networks: RwLock::new(supported_networks),
            syncing: RwLock::new(syncing),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Current configuration, including runtime additions to the ignore list.
    #[must_use]
    pub fn config(&self) -> Arc<UpstreamConfig> {
        self.config.load_full()
    }

    #[must_use]
    pub fn client_kind(&self) -> ClientKind {
        self.transport.kind()
    }

    #[must_use]
    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn auto_tuner(&self) -> Option<&Arc<RateLimitAutoTuner>> {
        self.auto_tuner.as_ref()
    }

    #[must_use]
    pub fn syncing_state(&self) -> EvmSyncingState {
        *self.syncing.read()
    }

    pub fn set_syncing_state(&self, state: EvmSyncingState) {
        let previous = std::mem::replace(&mut *self.syncing.write(), state);
        if previous != state {
            debug!(upstream = %self.id, from = previous.as_str(), to = state.as_str(), "syncing state changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_syncing_state(&self.id, state);
        }
    }

    /// Whether the configured ignore/allow lists let this upstream serve `method`.
    ///
    /// Ignore patterns are applied first, then allow patterns, so "ignore everything except
    /// `eth_getLogs`" is expressible. The answer is memoized per method.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`] if a configured pattern is malformed.
    pub fn should_handle_method(&self, method: &str) -> Result<bool, GatewayError> {
        if let Some(allowed) = self.method_memo.read().get(method) {
            return Ok(*allowed);
        }

        // computed under the write lock so a concurrent ignore_method cannot be overwritten
        let mut memo = self.method_memo.write();
        if let Some(allowed) = memo.get(method) {
            return Ok(*allowed);
        }

        let config = self.config.load();
        let mut allowed = true;
        for pattern in &config.ignore_methods {
            if wildcard_match(pattern, method)? {
                allowed = false;
                break;
            }
        }
        for pattern in &config.allow_methods {
            if wildcard_match(pattern, method)? {
                allowed = true;
                break;
            }
        }

        memo.insert(method.to_string(), allowed);
        debug!(upstream = %self.id, method = %method, allowed, "method support result");
        Ok(allowed)
    }

    /// Adds `method` to the ignore list when auto-ignore is enabled, evicting its memo entry.
    pub fn ignore_method(&self, method: &str) {
        if !self.config.load().auto_ignore_unsupported_methods {
            return;
        }

        let mut memo = self.method_memo.write();
        self.config.rcu(|current| {
            let mut next = UpstreamConfig::clone(current);
            if !next.ignore_methods.iter().any(|m| m == method) {
                next.ignore_methods.push(method.to_string());
            }
            next
        });
        memo.remove(method);
        debug!(upstream = %self.id, method = %method, "method ignored after unsupported-method response");
    }

    /// The reason this upstream must not serve `request`, if any. The first reason wins.
    #[must_use]
    pub fn should_skip(&self, request: &NormalizedRequest) -> Option<GatewayError> {
        let config = self.config.load();
        let method = request.method();

        if config.upstream_type == UpstreamType::Evm && self.syncing_state() == EvmSyncingState::Syncing {
            return Some(GatewayError::UpstreamSyncing { upstream: self.id.to_string() });
        }

        match self.should_handle_method(&method) {
            Ok(true) => {}
            Ok(false) => {
                return Some(GatewayError::UpstreamMethodIgnored {
                    method,
                    upstream: self.id.to_string(),
                })
            }
            Err(e) => return Some(e),
        }

        if let Some(pattern) = request.directives().use_upstream {
            match wildcard_match(&pattern, &self.id) {
                Ok(true) => {}
                Ok(false) => return Some(GatewayError::UpstreamNotAllowed { upstream: self.id.to_string() }),
                Err(e) => return Some(e.into()),
            }
        }

        self.check_block_availability(request, &config, &method)
    }

    fn check_block_availability(
        &self,
        request: &NormalizedRequest,
        config: &UpstreamConfig,
        method: &str,
    ) -> Option<GatewayError> {
        let max_recent_blocks = config.evm.max_available_recent_blocks;
        if config.evm.node_type != EvmNodeType::Full || max_recent_blocks == 0 {
            return None;
        }

        let block = {
            let rpc = request.json_rpc();
            BlockParameter::from_request(method, rpc.params.as_ref())
        };
        let block = block.filter(|b| *b > 0)?;
        let latest_block = request.network()?.state_poller_of(&self.id)?.latest_block();

        if latest_block > 0 && block < latest_block.saturating_sub(max_recent_blocks) && block <= latest_block {
            return Some(GatewayError::UpstreamNodeTypeMismatch {
                upstream: self.id.to_string(),
                block,
                latest_block,
                max_recent_blocks,
                node_type: EvmNodeType::Full,
            });
        }
        None
    }

    /// Takes one permit from every budget rule matching `method`, stopping at the first denial.
    fn check_rate_limits(&self, method: &str, network_id: &str) -> Result<(), GatewayError> {
        let config = self.config.load();
        let Some(budget_id) = config.rate_limit_budget.as_deref() else {
            return Ok(());
        };
        let budget = self.rate_limiters.get_budget(budget_id)?;

        for rule in budget.rules_by_method(method) {
            if rule.limiter().try_acquire_permit() {
                trace!(upstream = %self.id, budget = %budget_id, rule = %rule.config().method, "upstream-level rate limit passed");
                continue;
            }

            debug!(upstream = %self.id, budget = %budget_id, rule = %rule.config().method, method = %method, "upstream-level rate limit exceeded");
            if let Some(metrics) = &self.metrics {
                metrics.record_self_rate_limited(&self.id, network_id, method, budget_id);
            }
            return Err(GatewayError::UpstreamRateLimitRuleExceeded {
                upstream: self.id.to_string(),
                budget: budget_id.to_string(),
                rule: format!(
                    "{} {}/{}ms",
                    rule.config().method,
                    rule.limiter().capacity(),
                    rule.config().period_ms
                ),
                retry_after: Some(rule.limiter().time_until_next_permit()),
            });
        }
        Ok(())
    }

    fn prepare_request(&self, request: &NormalizedRequest) -> Result<(), GatewayError> {
        let upstream_type = self.config.load().upstream_type;
        match (upstream_type, self.transport.kind()) {
            (UpstreamType::Evm, ClientKind::HttpJsonRpc) => {
                request.normalize_evm_params();
                Ok(())
            }
            (upstream_type, kind) => Err(GatewayError::Internal(format!(
                "unsupported client {kind:?} for {upstream_type:?} upstream {}",
                self.id
            ))),
        }
    }

    /// Forwards `request` to this upstream through the rate check and resilience pipeline.
    ///
    /// `bypass_method_exclusion` skips the eligibility filter. It is used by internal probes
    /// that must reach the node regardless of ignore lists or syncing state.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UpstreamRequestSkipped`] if the eligibility filter excludes this upstream
    /// - [`GatewayError::UpstreamRateLimitRuleExceeded`] if a budget rule denied the request
    /// - the caller's cause if `ctx` finished first
    /// - otherwise [`GatewayError::UpstreamRequest`] wrapping the final cause with counters
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
        bypass_method_exclusion: bool,
    ) -> Result<NormalizedResponse, GatewayError> {
        let started = Instant::now();
        let method = request.method();
        let network_id = request.network_id();

        if !bypass_method_exclusion {
            if let Some(reason) = self.should_skip(request) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_upstream_skipped(&self.id, &network_id, &method, reason.code());
                }
                return Err(GatewayError::UpstreamRequestSkipped {
                    upstream: self.id.to_string(),
                    reason: Box::new(reason),
                });
            }
        }

        self.check_rate_limits(&method, &network_id)?;

        request.set_last_upstream(Arc::clone(&self.id));
        self.prepare_request(request)?;

        let state = ExecutionState::default();
        let options = ExecutionOptions {
            retry_empty: request.directives().retry_empty &&
                self.syncing_state() != EvmSyncingState::NotSyncing,
        };

        let result = self
            .pipeline
            .execute(ctx, &state, options, || self.try_forward(ctx, request, &method, &network_id))
            .await;

        let counters = state.snapshot();
        if let Some(metrics) = &self.metrics {
            metrics.record_retries(&self.id, counters.retries);
            metrics.record_hedges(&self.id, counters.hedges);
        }

        match result {
            Ok(response) => {
                response.set_metadata(ResponseMetadata {
                    from_cache: false,
                    upstream: Some(Arc::clone(&self.id)),
                    attempts: counters.attempts,
                    retries: counters.retries,
                    hedges: counters.hedges,
                });
                Ok(response)
            }
            Err(err) => {
                let cause = match (&err, ctx.cause_if_done()) {
                    (GatewayError::EndpointRequestTimeout { .. }, Some(caller_cause)) => caller_cause,
                    _ => err,
                };
                Err(UpstreamRequestError {
                    upstream: self.id.to_string(),
                    network: network_id,
                    method,
                    elapsed: started.elapsed(),
                    counters,
                    cause,
                }
                .into())
            }
        }
    }

    /// One send, with per-attempt metrics and auto-tuner feedback.
    async fn try_forward(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
        method: &str,
        network_id: &str,
    ) -> Result<NormalizedResponse, GatewayError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_request(&self.id, network_id, method);
        }
        let started = Instant::now();
        let result = self.transport.send(ctx, request).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_duration(&self.id, network_id, method, started.elapsed().as_secs_f64());
        }

        match result {
            Ok(response) => {
                if response.is_result_emptyish() {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_empty_response(&self.id, network_id, method);
                    }
                }
                request.set_last_valid_response(response.clone());
                if let Some(tuner) = &self.auto_tuner {
                    tuner.record_success(method);
                }
                Ok(response)
            }
            Err(e) => {
                let err = GatewayError::Upstream(e);
                self.record_failure(&err, method, network_id);
                if let GatewayError::Upstream(e) = &err {
                    if e.is_method_not_supported() {
                        self.ignore_method(method);
                    }
                }
                Err(err)
            }
        }
    }

    fn record_failure(&self, err: &GatewayError, method: &str, network_id: &str) {
        if err.is_capacity_exceeded() {
            if let Some(metrics) = &self.metrics {
                metrics.record_remote_rate_limited(&self.id, network_id, method);
            }
            if let Some(tuner) = &self.auto_tuner {
                tuner.record_error(method);
            }
            return;
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        match err.root().code() {
            "ErrEndpointMissingData" => metrics.record_missing_data(&self.id, network_id, method),
            "ErrEndpointRequestSkipped" => {
                metrics.record_upstream_skipped(&self.id, network_id, method, "ErrEndpointRequestSkipped");
            }
            _ if err.is_client_side() => {}
            _ => metrics.record_upstream_failure(&self.id, network_id, method, err),
        }
    }

    /// Whether this upstream serves `network_id`. Only positive answers are cached.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the probe fails.
    pub async fn supports_network(&self, ctx: &RequestContext, network_id: &str) -> Result<bool, GatewayError> {
        if let Some(chain_id) = self.config.load().evm.chain_id {
            return Ok(network_id == format!("evm:{chain_id}"));
        }
        if self.supported_networks.read().get(network_id).copied().unwrap_or(false) {
            return Ok(true);
        }

        let supports = self.transport.supports_network(ctx, network_id).await?;
        self.supported_networks.write().insert(network_id.to_string(), supports);
        Ok(supports)
    }

    /// Asks the node for its chain id with `eth_chainId`.
    ///
    /// # Errors
    ///
    /// Returns the forward error, or [`GatewayError::Upstream`] if the result is not a quantity.
    pub async fn evm_chain_id(&self, ctx: &RequestContext) -> Result<u64, GatewayError> {
        let probe = NormalizedRequest::new(JsonRpcRequest::new("eth_chainId", Some(json!([])), json!(75412)));
        let response = self.forward(ctx, &probe, true).await?;
        response
            .result()
            .and_then(Value::as_str)
            .and_then(BlockParameter::parse_hex)
            .ok_or_else(|| {
                UpstreamError::InvalidResponse("eth_chainId did not return a hex quantity".to_string()).into()
            })
    }

    /// Fills in what the config leaves out: the chain id (probed) and the recent-block
    /// window of full nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamClientInitialization`] if the chain id probe fails.
    pub async fn detect_features(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        let config = self.config.load_full();
        if config.upstream_type != UpstreamType::Evm {
            return Ok(());
        }

        let mut detected_chain_id = None;
        if config.evm.chain_id.is_none() {
            let chain_id = self.evm_chain_id(ctx).await.map_err(|e| {
                GatewayError::UpstreamClientInitialization {
                    upstream: self.id.to_string(),
                    reason: format!("failed to get chain id: {e}"),
                }
            })?;
            self.supported_networks.write().insert(format!("evm:{chain_id}"), true);
            detected_chain_id = Some(chain_id);
        }

        let default_window = config.evm.node_type == EvmNodeType::Full &&
            config.evm.max_available_recent_blocks == 0;

        if detected_chain_id.is_some() || default_window {
            self.config.rcu(|current| {
                let mut next = UpstreamConfig::clone(current);
                if let Some(chain_id) = detected_chain_id {
                    next.evm.chain_id = Some(chain_id);
                }
                if default_window && next.evm.max_available_recent_blocks == 0 {
                    next.evm.max_available_recent_blocks = DEFAULT_FULL_NODE_RECENT_BLOCKS;
                }
                next
            });
        }

        debug!(upstream = %self.id, chain_id = ?self.config.load().evm.chain_id, "upstream features detected");
        Ok(())
    }

    /// Routing weights for `(network, method)`: the first matching entry, else all 1.0.
    #[must_use]
    pub fn get_score_multipliers(&self, network_id: &str, method: &str) -> ScoreMultiplierConfig {
        self.config
            .load()
            .routing
            .score_multipliers
            .iter()
            .find(|m| {
                wildcard_match(&m.network, network_id).unwrap_or(false) &&
                    wildcard_match(&m.method, method).unwrap_or(false)
            })
            .cloned()
            .unwrap_or_default()
    }

    pub async fn circuit_breaker_state(&self) -> Option<CircuitBreakerState> {
        match self.pipeline.circuit_breaker() {
            Some(breaker) => Some(breaker.get_state().await),
            None => None,
        }
    }

    pub async fn status(&self) -> UpstreamStatus {
        use crate::metrics::MetricsState;

        let mut active_networks: Vec<String> = self
            .supported_networks
            .read()
            .iter()
            .filter(|(_, supported)| **supported)
            .map(|(id, _)| id.clone())
            .collect();
        active_networks.sort();

        UpstreamStatus {
            id: self.id.to_string(),
            syncing: self.syncing_state(),
            circuit_breaker: self.circuit_breaker_state().await.map(|s| s.as_metric_str()),
            rate_limit_budget: self.config.load().rate_limit_budget.clone(),
            active_networks,
        }
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
