use ahash::AHashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    config::UpstreamConfig,
    context::RequestContext,
    errors::GatewayError,
    metrics::MetricsCollector,
    rate_limit::RateLimitersRegistry,
    upstream::{http_transport::HttpJsonRpcTransport, transport::UpstreamTransport, Upstream},
    utils::buffer_pool::BufferPool,
};

/// The upstreams of one project, in configured order.
#[derive(Debug)]
pub struct UpstreamsRegistry {
    project_id: String,
    upstreams: Vec<Arc<Upstream>>,
    by_id: AHashMap<String, Arc<Upstream>>,
    rate_limiters: Arc<RateLimitersRegistry>,
    buffers: Arc<BufferPool>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl UpstreamsRegistry {
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        rate_limiters: Arc<RateLimitersRegistry>,
        buffers: Arc<BufferPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            upstreams: Vec::new(),
            by_id: AHashMap::new(),
            rate_limiters,
            buffers,
            metrics,
        }
    }

    /// Builds the HTTP transport for `config` and registers the upstream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamClientInitialization`] if the transport cannot be
    /// built, or the error of [`register_with_transport`](Self::register_with_transport).
    pub fn register(&mut self, config: UpstreamConfig) -> Result<Arc<Upstream>, GatewayError> {
        let transport = HttpJsonRpcTransport::new(
            config.id.clone(),
            &config.endpoint,
            config.max_concurrent_requests,
            Arc::clone(&self.buffers),
        )
        .map_err(|e| GatewayError::UpstreamClientInitialization {
            upstream: config.id.clone(),
            reason: e.to_string(),
        })?
        .with_max_response_bytes(config.max_response_bytes);

        self.register_with_transport(config, Arc::new(transport))
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] for a duplicate id, or the error of
    /// [`Upstream::new`].
    pub fn register_with_transport(
        &mut self,
        config: UpstreamConfig,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<Arc<Upstream>, GatewayError> {
        if self.by_id.contains_key(&config.id) {
            return Err(GatewayError::Internal(format!(
                "duplicate upstream id {} in project {}",
                config.id, self.project_id
            )));
        }

        let upstream = Arc::new(Upstream::new(
            self.project_id.clone(),
            config,
            transport,
            Arc::clone(&self.rate_limiters),
            self.metrics.clone(),
        )?);

        self.by_id.insert(upstream.id().to_string(), Arc::clone(&upstream));
        self.upstreams.push(Arc::clone(&upstream));
        Ok(upstream)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Upstream>> {
        self.by_id.get(id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Runs feature detection on every upstream concurrently.
    ///
    /// Upstreams that fail detection stay registered. They are reported, and requests to
    /// them fail on their own until the node recovers.
    pub async fn bootstrap(&self, ctx: &RequestContext) -> Vec<(String, GatewayError)> {
        let results = join_all(self.upstreams.iter().map(|upstream| async move {
            (upstream.id().to_string(), upstream.detect_features(ctx).await)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        for (id, err) in &failures {
            warn!(project = %self.project_id, upstream = %id, error = %err, "upstream feature detection failed");
        }
        info!(
            project = %self.project_id,
            upstreams = self.upstreams.len(),
            failed = failures.len(),
            "upstreams bootstrapped"
        );
        failures
    }

    /// Upstreams serving `network_id`, in configured order. Probe failures count as "no".
    pub async fn upstreams_for_network(&self, ctx: &RequestContext, network_id: &str) -> Vec<Arc<Upstream>> {
        let checks = join_all(self.upstreams.iter().map(|upstream| async move {
            match upstream.supports_network(ctx, network_id).await {
                Ok(supported) => supported,
                Err(e) => {
                    warn!(upstream = upstream.id(), network = %network_id, error = %e, "network support probe failed");
                    false
                }
            }
        }))
        .await;

        self.upstreams
            .iter()
            .zip(checks)
            .filter_map(|(upstream, supported)| supported.then(|| Arc::clone(upstream)))
            .collect()
    }
}
