//! # Metrics
//!
//! Prometheus series recorded through the `metrics` facade. Recording is fire-and-forget:
//! nothing on the request path ever waits on, or fails because of, a metric.
//!
//! | Series | Kind | Labels |
//! |--------|------|--------|
//! | `conduit_upstream_requests_total` | counter | upstream, network, method |
//! | `conduit_upstream_request_duration_seconds` | histogram | upstream, network, method |
//! | `conduit_upstream_failures_total` | counter | upstream, network, method, error |
//! | `conduit_upstream_self_rate_limited_total` | counter | upstream, network, method, budget |
//! | `conduit_upstream_remote_rate_limited_total` | counter | upstream, network, method |
//! | `conduit_upstream_skipped_total` | counter | upstream, network, method, reason |
//! | `conduit_upstream_missing_data_total` | counter | upstream, network, method |
//! | `conduit_upstream_empty_response_total` | counter | upstream, network, method |
//! | `conduit_upstream_retries_total` / `conduit_upstream_hedges_total` | counter | upstream |
//! | `conduit_rate_budget_capacity` | gauge | budget, method |
//! | `conduit_circuit_breaker_state` | gauge | upstream |
//! | `conduit_batch_requests_total`, `conduit_batch_size` | counter, histogram | |
//! | `conduit_buffer_pool_outstanding` | gauge | |
//!
//! Upstream ids are exposed in labels. Keep `/metrics` on an internal network if ids
//! carry anything sensitive.

use crate::{
    errors::GatewayError, resilience::circuit_breaker::CircuitBreakerState,
    types::EvmSyncingState,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{borrow::Cow, sync::OnceLock};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[inline]
fn method_label(method: &str) -> Cow<'static, str> {
    match method {
        "eth_blockNumber" => Cow::Borrowed("eth_blockNumber"),
        "eth_chainId" => Cow::Borrowed("eth_chainId"),
        "eth_syncing" => Cow::Borrowed("eth_syncing"),
        "eth_call" => Cow::Borrowed("eth_call"),
        "eth_getBalance" => Cow::Borrowed("eth_getBalance"),
        "eth_getBlockByNumber" => Cow::Borrowed("eth_getBlockByNumber"),
        "eth_getLogs" => Cow::Borrowed("eth_getLogs"),
        "eth_getTransactionReceipt" => Cow::Borrowed("eth_getTransactionReceipt"),
        _ => Cow::Owned(method.to_string()),
    }
}

/// Maps runtime state enums onto metric labels and gauge values.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for CircuitBreakerState {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 0.5,
        }
    }
}

impl MetricsState for EvmSyncingState {
    fn as_metric_str(&self) -> &'static str {
        self.as_str()
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::NotSyncing => 0.0,
            Self::Syncing => 1.0,
            Self::Unknown => 0.5,
        }
    }
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to install global Prometheus recorder, using a detached one"
                );
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Updates the buffer pool gauge. Called by the pool itself on checkout and return.
#[allow(clippy::cast_precision_loss)]
pub fn record_buffer_pool_outstanding(outstanding: usize) {
    gauge!("conduit_buffer_pool_outstanding").set(outstanding as f64);
}

/// Facade over the recorded series. Cheap to clone.
#[derive(Clone)]
pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// # Errors
    ///
    /// Returns an error if the Prometheus recorder cannot be initialized.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self { prometheus_handle: init_prometheus_recorder() })
    }

    /// Renders all series in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }

    pub fn record_upstream_request(&self, upstream: &str, network: &str, method: &str) {
        counter!(
            "conduit_upstream_requests_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method)
        )
        .increment(1);
    }

    pub fn record_upstream_duration(
        &self,
        upstream: &str,
        network: &str,
        method: &str,
        seconds: f64,
    ) {
        histogram!(
            "conduit_upstream_request_duration_seconds",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method)
        )
        .record(seconds);
    }

    pub fn record_upstream_failure(
        &self,
        upstream: &str,
        network: &str,
        method: &str,
        error: &GatewayError,
    ) {
        counter!(
            "conduit_upstream_failures_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method),
            "error" => error.root().code()
        )
        .increment(1);
    }

    pub fn record_self_rate_limited(
        &self,
        upstream: &str,
        network: &str,
        method: &str,
        budget: &str,
    ) {
        counter!(
            "conduit_upstream_self_rate_limited_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method),
            "budget" => budget.to_string()
        )
        .increment(1);
    }

    pub fn record_remote_rate_limited(&self, upstream: &str, network: &str, method: &str) {
        counter!(
            "conduit_upstream_remote_rate_limited_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method)
        )
        .increment(1);
    }

    pub fn record_upstream_skipped(
        &self,
        upstream: &str,
        network: &str,
        method: &str,
        reason: &'static str,
    ) {
        counter!(
            "conduit_upstream_skipped_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_missing_data(&self, upstream: &str, network: &str, method: &str) {
        counter!(
            "conduit_upstream_missing_data_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method)
        )
        .increment(1);
    }

    pub fn record_empty_response(&self, upstream: &str, network: &str, method: &str) {
        counter!(
            "conduit_upstream_empty_response_total",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
            "method" => method_label(method)
        )
        .increment(1);
    }

    pub fn record_retries(&self, upstream: &str, retries: u32) {
        if retries > 0 {
            counter!("conduit_upstream_retries_total", "upstream" => upstream.to_string())
                .increment(u64::from(retries));
        }
    }

    pub fn record_hedges(&self, upstream: &str, hedges: u32) {
        if hedges > 0 {
            counter!("conduit_upstream_hedges_total", "upstream" => upstream.to_string())
                .increment(u64::from(hedges));
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_rate_budget_capacity(&self, budget: &str, method: &str, capacity: u64) {
        gauge!(
            "conduit_rate_budget_capacity",
            "budget" => budget.to_string(),
            "method" => method.to_string()
        )
        .set(capacity as f64);
    }

    pub fn record_circuit_breaker_state(&self, upstream: &str, state: CircuitBreakerState) {
        gauge!("conduit_circuit_breaker_state", "upstream" => upstream.to_string())
            .set(state.as_gauge_value());
        counter!(
            "conduit_circuit_breaker_transitions_total",
            "upstream" => upstream.to_string(),
            "to_state" => state.as_metric_str()
        )
        .increment(1);
    }

    pub fn record_syncing_state(&self, upstream: &str, state: EvmSyncingState) {
        gauge!("conduit_upstream_syncing_state", "upstream" => upstream.to_string())
            .set(state.as_gauge_value());
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_upstream_block_head(&self, upstream: &str, block: u64) {
        gauge!("conduit_upstream_latest_block", "upstream" => upstream.to_string())
            .set(block as f64);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_batch_request(&self, batch_size: usize) {
        histogram!("conduit_batch_size").record(batch_size as f64);
        counter!("conduit_batch_requests_total").increment(1);
    }
}
