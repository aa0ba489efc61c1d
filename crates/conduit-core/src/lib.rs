//! # Conduit Core
//!
//! Upstream execution and resilience engine for the Conduit JSON-RPC gateway.
//!
//! - **[`dispatcher`]**: splits a payload into items and runs each one on its own task.
//! - **[`project`]** and **[`network`]**: tenant and chain boundaries, upstream failover.
//! - **[`upstream`]**: eligibility filtering, rate budget checks and forwarding to one node.
//! - **[`rate_limit`]**: named token-bucket budgets and their auto-tuner.
//! - **[`resilience`]**: timeout, retry, circuit breaker and hedge policies.
//! - **[`normalizer`]**: canonical success and error envelopes with metadata.
//! - **[`metrics`]**: Prometheus series recorded through the `metrics` facade.
//!
//! ## Request Flow
//!
//! ```text
//! Inbound payload
//!       │
//!       ▼
//! ┌────────────┐   one task per item
//! │ Dispatcher │ ──────────────────────┐
//! └────────────┘                       │
//!                                      ▼
//!                      decode ─► directives ─► auth ─► network
//!                                                        │
//!                                                        ▼
//!                                          ┌──────────────────────┐
//!                                          │ Network::forward     │
//!                                          │ (upstreams in order) │
//!                                          └──────────┬───────────┘
//!                                                     ▼
//!                                  should_skip ─► rate budget ─► ResiliencePipeline
//!                                                                      │
//!                                                                      ▼
//!                                                             UpstreamTransport::send
//!                                                                      │
//!       ┌──────────────────────────────────────────────────────────────┘
//!       ▼
//! ┌────────────┐
//! │ Normalizer │ ─► ordered envelopes + X-Conduit-* metadata
//! └────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod network;
pub mod normalizer;
pub mod project;
pub mod rate_limit;
pub mod resilience;
pub mod types;
pub mod upstream;
pub mod utils;
