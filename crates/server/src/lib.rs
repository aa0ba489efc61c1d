//! HTTP boundary of the Conduit gateway.
//!
//! Maps `/{project}/{architecture}/{chain_id}`, `/{project}` and `/{project}/admin` onto the
//! core [`Dispatcher`](conduit_core::dispatcher::Dispatcher), and serves `/health` and
//! `/metrics`.

pub mod router;

pub use router::{create_app, AppState};
