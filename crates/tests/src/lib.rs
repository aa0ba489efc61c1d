//! Integration tests for the Conduit gateway.
//!
//! - `dispatcher_tests`: batch ordering, per-item isolation and deadlines
//! - `upstream_tests`: eligibility filtering, method memo eviction, rate budgets and tuning
//! - `network_tests`: ordered failover and block availability on full nodes
//! - `failsafe_integration_tests`: timeouts, cancellation, retries and the circuit breaker
//! - `hedging_tests`: hedged sends and cancellation of the losing attempt
//! - `http_transport_tests`: the HTTP transport end to end against mockito nodes
//! - `mock_infrastructure`: reusable transports, mock nodes and fixtures
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod dispatcher_tests;

#[cfg(test)]
mod upstream_tests;

#[cfg(test)]
mod network_tests;


#[cfg(test)]
mod hedging_tests;

#[cfg(test)]
mod http_transport_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
