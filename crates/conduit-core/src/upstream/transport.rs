use async_trait::async_trait;

use crate::{
    context::RequestContext,
    types::{ClientKind, NormalizedRequest, NormalizedResponse},
    upstream::errors::UpstreamError,
};

/// Sends one normalized request to one upstream endpoint.
///
/// Implementations classify failures into [`UpstreamError`] and must not retry on their
/// own; retries, hedging and timeouts belong to the resilience pipeline.
#[async_trait]
pub trait UpstreamTransport: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ClientKind;

    async fn send(
        &self,
        ctx: &RequestContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, UpstreamError>;

    /// Whether the endpoint serves `network_id` (e.g. `evm:1`).
    async fn supports_network(
        &self,
        ctx: &RequestContext,
        network_id: &str,
    ) -> Result<bool, UpstreamError>;
}
