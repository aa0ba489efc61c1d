//! Test helper functions and fixtures.

use conduit_core::{
    config::{
        NetworkConfig, ProjectAdminConfig, ProjectAuthConfig, ProjectConfig, RateLimitBudgetConfig,
        RateLimitRuleConfig, RateLimiterConfig, UpstreamConfig,
    },
    dispatcher::{Dispatcher, InboundRequest},
    metrics::MetricsCollector,
    network::{BlockTracker, Network, StatePoller},
    project::{Project, ProjectsRegistry},
    rate_limit::RateLimitersRegistry,
    types::{JsonRpcRequest, NetworkArchitecture, NormalizedRequest, RequestDirectives},
    upstream::{Upstream, UpstreamTransport, UpstreamsRegistry},
    utils::BufferPool,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

/// `evm:1`, the network every helper targets.
#[must_use]
pub fn mainnet() -> NetworkConfig {
    NetworkConfig { architecture: NetworkArchitecture::Evm, chain_id: 1 }
}

/// Upstream config with a known chain id, so bootstrap does not probe `eth_chainId`.
#[must_use]
pub fn upstream_config(id: &str) -> UpstreamConfig {
    let mut config = UpstreamConfig::new(id, format!("http://{id}.invalid"));
    config.evm.chain_id = Some(1);
    config
}

#[must_use]
pub fn rate_limiters(budgets: Vec<RateLimitBudgetConfig>) -> Arc<RateLimitersRegistry> {
    Arc::new(
        RateLimitersRegistry::new(&RateLimiterConfig { budgets }).expect("valid test rate limiters"),
    )
}

#[must_use]
pub fn rule(method: &str, max_count: u64) -> RateLimitRuleConfig {
    RateLimitRuleConfig { method: method.to_string(), max_count, period_ms: 60_000 }
}

#[must_use]
pub fn build_upstream(
    config: UpstreamConfig,
    transport: Arc<dyn UpstreamTransport>,
    limiters: Option<Arc<RateLimitersRegistry>>,
) -> Arc<Upstream> {
    let limiters = limiters.unwrap_or_else(|| rate_limiters(vec![]));
    Arc::new(Upstream::new("main", config, transport, limiters, None).expect("valid test upstream"))
}

/// A network over `upstreams` in order, with a head tracker registered per upstream.
#[must_use]
pub fn build_network(upstreams: Vec<Arc<Upstream>>, latest_block: u64) -> Arc<Network> {
    let network = Network::new(&mainnet(), upstreams);
    for upstream in network.upstreams() {
        let tracker: Arc<dyn StatePoller> = Arc::new(BlockTracker::with_latest(latest_block));
        network.register_state_poller(upstream.id(), tracker);
    }
    Arc::new(network)
}

#[must_use]
pub fn request(method: &str, params: Value) -> NormalizedRequest {
    NormalizedRequest::new(JsonRpcRequest::new(method, Some(params), json!(1)))
}

/// A request already bound to `network`.
#[must_use]
pub fn request_on(network: &Arc<Network>, method: &str, params: Value) -> NormalizedRequest {
    let request = request(method, params);
    request.set_network(Arc::clone(network));
    request
}

/// A bootstrapped single-network project over scripted upstreams.
pub async fn build_project(
    secrets: Vec<String>,
    upstreams: Vec<(UpstreamConfig, Arc<dyn UpstreamTransport>)>,
) -> Project {
    let mut registry =
        UpstreamsRegistry::new("main", rate_limiters(vec![]), BufferPool::new(64), None);
    for (config, transport) in upstreams {
        registry.register_with_transport(config, transport).expect("unique upstream ids");
    }

    let config = ProjectConfig {
        id: "main".to_string(),
        admin: ProjectAdminConfig::default(),
        auth: ProjectAuthConfig { secrets },
        networks: vec![mainnet()],
        upstreams: vec![],
    };
    Project::from_registry(&config, registry, None).await
}

#[must_use]
pub fn build_dispatcher(project: Project, max_timeout: Duration) -> Dispatcher {
    let mut projects = ProjectsRegistry::default();
    projects.insert(project);
    Dispatcher::new(Arc::new(projects), max_timeout, None)
}

#[must_use]
pub fn build_dispatcher_with_metrics(
    project: Project,
    metrics: Arc<MetricsCollector>,
) -> Dispatcher {
    let mut projects = ProjectsRegistry::default();
    projects.insert(project);
    Dispatcher::new(Arc::new(projects), Duration::from_secs(5), Some(metrics))
}

/// An inbound request for `POST /main/evm/1`.
#[must_use]
pub fn inbound(body: &str) -> InboundRequest {
    InboundRequest {
        project_id: "main".to_string(),
        network_id: Some("evm:1".to_string()),
        admin: false,
        directives: RequestDirectives::default(),
        auth: conduit_core::auth::AuthPayload::default(),
        body: Bytes::from(body.to_string()),
    }
}
