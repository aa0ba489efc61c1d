//! Upstream nodes and everything that talks to them.
//!
//! - [`Upstream`]: one configured node. It owns the eligibility filter (`should_skip`), the
//!   rate budget check, the resilience pipeline and the auto-tuner, and exposes `forward`.
//! - [`UpstreamTransport`]: the wire boundary. [`HttpJsonRpcTransport`] is the JSON-RPC over
//!   HTTP implementation.
//! - [`UpstreamsRegistry`]: the upstreams of a project, in configured order.
//! - [`EvmStatePoller`]: background head and syncing probes.
//!
//! # Forward path
//!
//! ```text
//! Upstream::forward
//!   │
//!   ├─ should_skip ───────── Some(reason) ──► UpstreamRequestSkipped
//!   ├─ rate budget rules ─── first deny ────► UpstreamRateLimitRuleExceeded
//!   ├─ prepare (normalize EVM params)
//!   └─ ResiliencePipeline::execute
//!        └─ try_forward ──► UpstreamTransport::send
//!                             ├─ Ok  ──► metadata (upstream, attempts, retries, hedges)
//!                             └─ Err ──► UpstreamRequest { cause, counters, ... }
//! ```

pub mod endpoint;
pub mod errors;
pub mod http_transport;
pub mod poller;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use endpoint::{Upstream, UpstreamStatus, DEFAULT_FULL_NODE_RECENT_BLOCKS};
pub use errors::{RpcErrorCategory, UpstreamError};
pub use http_transport::HttpJsonRpcTransport;
pub use poller::EvmStatePoller;
pub use registry::UpstreamsRegistry;
pub use transport::UpstreamTransport;
