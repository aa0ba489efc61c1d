//! Mock infrastructure for testing the Conduit gateway without real nodes.
//!
//! ## Components
//!
//! - `ScriptedTransport`: an in-process [`UpstreamTransport`] with per-method outcomes,
//!   artificial latency, call counting and cancellation tracking
//! - `RpcMockBuilder`: wraps mockito to serve EVM JSON-RPC over HTTP
//! - Test helpers for building upstreams, networks and projects
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{ScriptedTransport, build_upstream};
//!
//! let transport = ScriptedTransport::new().respond("eth_blockNumber", json!("0x10"));
//! let upstream = build_upstream(UpstreamConfig::new("up-1", "http://node"), transport.clone(), None);
//! ```
//!
//! [`UpstreamTransport`]: conduit_core::upstream::UpstreamTransport

pub mod rpc_mock;
pub mod scripted_transport;
pub mod test_helpers;

pub use rpc_mock::RpcMockBuilder;
pub use scripted_transport::{ScriptedTransport, Step};
pub use test_helpers::*;
