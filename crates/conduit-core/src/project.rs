//! Projects: the tenant boundary of the gateway.
//!
//! A [`Project`] bundles its upstreams, the networks they serve, and the authenticators
//! guarding the consumer and admin paths. [`ProjectsRegistry`] is built once from
//! [`AppConfig`] at startup and handed to the dispatcher.

use ahash::AHashMap;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    auth::{AuthPayload, Authenticator, SecretAuthenticator},
    config::{AppConfig, ProjectConfig},
    context::RequestContext,
    errors::GatewayError,
    metrics::MetricsCollector,
    network::{Network, StatePoller},
    rate_limit::RateLimitersRegistry,
    types::{NormalizedRequest, NormalizedResponse, UpstreamType},
    upstream::{EvmStatePoller, UpstreamsRegistry},
    utils::buffer_pool::BufferPool,
};

/// Bound on feature detection and network probes during startup.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_POOLED_BUFFERS: usize = 256;

pub const ADMIN_UPSTREAMS_METHOD: &str = "conduit_upstreams";

pub struct Project {
    id: String,
    networks: AHashMap<String, Arc<Network>>,
    upstreams: UpstreamsRegistry,
    pollers: Vec<Arc<EvmStatePoller>>,
    consumer_auth: Arc<dyn Authenticator>,
    admin_auth: Arc<dyn Authenticator>,
    admin_enabled: bool,
}

impl Project {
    /// Registers the configured upstreams over HTTP and bootstraps the project.
    ///
    /// # Errors
    ///
    /// Returns the first upstream registration error.
    pub async fn bootstrap(
        config: &ProjectConfig,
        rate_limiters: Arc<RateLimitersRegistry>,
        buffers: Arc<BufferPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self, GatewayError> {
        let mut registry = UpstreamsRegistry::new(config.id.clone(), rate_limiters, buffers, metrics.clone());
        for upstream in &config.upstreams {
            registry.register(upstream.clone())?;
        }
        Ok(Self::from_registry(config, registry, metrics).await)
    }

    /// Bootstraps a project around already registered upstreams.
    ///
    /// Runs feature detection, then assigns every configured network the upstreams that
    /// serve it and wires their head trackers in.
    pub async fn from_registry(
        config: &ProjectConfig,
        upstreams: UpstreamsRegistry,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let ctx = RequestContext::with_timeout(BOOTSTRAP_TIMEOUT);
        upstreams.bootstrap(&ctx).await;

        let pollers: Vec<Arc<EvmStatePoller>> = upstreams
            .all()
            .iter()
            .filter(|u| u.config().upstream_type == UpstreamType::Evm)
            .map(|u| Arc::new(EvmStatePoller::new(Arc::clone(u), metrics.clone())))
            .collect();

        let mut networks = AHashMap::new();
        for network_config in &config.networks {
            let network_id = network_config.network_id();
            let serving = upstreams.upstreams_for_network(&ctx, &network_id).await;
            if serving.is_empty() {
                warn!(project = %config.id, network = %network_id, "no upstream serves this network");
            }

            let network = Network::new(network_config, serving);
            for poller in &pollers {
                let upstream_id = poller.upstream_id();
                if network.upstreams().iter().any(|u| u.id() == upstream_id) {
                    network.register_state_poller(upstream_id, poller.tracker() as Arc<dyn StatePoller>);
                }
            }
            networks.insert(network_id, Arc::new(network));
        }

        let consumer_auth = Arc::new(SecretAuthenticator::new(&config.auth.secrets));
        let admin_auth = if config.admin.auth.secrets.is_empty() {
            Arc::clone(&consumer_auth)
        } else {
            Arc::new(SecretAuthenticator::new(&config.admin.auth.secrets))
        };

        info!(project = %config.id, networks = networks.len(), upstreams = upstreams.len(), "project ready");

        Self {
            id: config.id.clone(),
            networks,
            upstreams,
            pollers,
            consumer_auth,
            admin_auth,
            admin_enabled: config.admin.enabled,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn upstreams(&self) -> &UpstreamsRegistry {
        &self.upstreams
    }

    #[must_use]
    pub fn admin_enabled(&self) -> bool {
        self.admin_enabled
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::NetworkNotFound`] for a network the project does not define.
    pub fn network(&self, network_id: &str) -> Result<Arc<Network>, GatewayError> {
        self.networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| GatewayError::NetworkNotFound(format!("{network_id} in project {}", self.id)))
    }

    pub fn networks(&self) -> impl Iterator<Item = &Arc<Network>> {
        self.networks.values()
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] if the payload is not accepted.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
        payload: &AuthPayload,
        admin: bool,
    ) -> Result<(), GatewayError> {
        let authenticator = if admin { &self.admin_auth } else { &self.consumer_auth };
        authenticator.authenticate(ctx, request, payload).await
    }

    /// Resolves the network, attaches it to the request and forwards.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NetworkNotFound`] or the error of [`Network::forward`].
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        network_id: &str,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, GatewayError> {
        let network = self.network(network_id)?;
        request.set_network(Arc::clone(&network));
        network.forward(ctx, request).await
    }

    /// Serves an admin JSON-RPC method.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Unauthorized`] when the admin path is disabled
    /// - [`GatewayError::MethodNotFound`] for anything but `conduit_upstreams`
    pub async fn admin_request(&self, request: &NormalizedRequest) -> Result<NormalizedResponse, GatewayError> {
        if !self.admin_enabled {
            return Err(GatewayError::Unauthorized("admin is not enabled for this project".to_string()));
        }

        let method = request.method();
        match method.as_str() {
            ADMIN_UPSTREAMS_METHOD => {
                let mut statuses = Vec::with_capacity(self.upstreams.len());
                for upstream in self.upstreams.all() {
                    statuses.push(upstream.status().await);
                }
                let result = serde_json::to_value(statuses)
                    .map_err(|e| GatewayError::Internal(format!("failed to encode upstream status: {e}")))?;
                Ok(NormalizedResponse::from_result(json!({ "upstreams": result })))
            }
            _ => Err(GatewayError::MethodNotFound(method)),
        }
    }

    /// Spawns the auto-tuners and state pollers. They stop when `shutdown` fires.
    pub fn start_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for upstream in self.upstreams.all() {
            if let Some(tuner) = upstream.auto_tuner() {
                handles.push(Arc::clone(tuner).start_with_shutdown(shutdown.subscribe()));
            }
        }
        for poller in &self.pollers {
            handles.push(Arc::clone(poller).start_with_shutdown(shutdown.subscribe()));
        }
        handles
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .field("admin_enabled", &self.admin_enabled)
            .finish_non_exhaustive()
    }
}

/// Every configured project, keyed by id.
#[derive(Debug, Default)]
pub struct ProjectsRegistry {
    projects: AHashMap<String, Arc<Project>>,
}

impl ProjectsRegistry {
    /// # Errors
    ///
    /// Returns an error if a rate budget rule is invalid or an upstream cannot be
    /// registered.
    pub async fn bootstrap(
        config: &AppConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self, GatewayError> {
        let rate_limiters = Arc::new(RateLimitersRegistry::new(&config.rate_limiters)?);
        let buffers = BufferPool::new(MAX_POOLED_BUFFERS);

        let mut registry = Self::default();
        for project_config in &config.projects {
            let project = Project::bootstrap(
                project_config,
                Arc::clone(&rate_limiters),
                Arc::clone(&buffers),
                metrics.clone(),
            )
            .await?;
            registry.insert(project);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, project: Project) {
        self.projects.insert(project.id().to_string(), Arc::new(project));
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::ProjectNotFound`] for an unknown id.
    pub fn get(&self, project_id: &str) -> Result<Arc<Project>, GatewayError> {
        self.projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| GatewayError::ProjectNotFound(project_id.to_string()))
    }

    pub fn projects(&self) -> impl Iterator<Item = &Arc<Project>> {
        self.projects.values()
    }

    pub fn start_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.projects.values().flat_map(|p| p.start_background(shutdown)).collect()
    }
}
