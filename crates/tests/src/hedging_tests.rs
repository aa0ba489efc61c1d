//! Hedged sends against a single upstream.

use crate::mock_infrastructure::{build_upstream, request, upstream_config, ScriptedTransport, Step};
use conduit_core::{
    config::{FailsafeConfig, HedgePolicyConfig, TimeoutPolicyConfig, UpstreamConfig},
    context::RequestContext,
    upstream::{UpstreamError, UpstreamTransport},
};
use serde_json::json;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

fn hedged(delay_ms: u64, timeout_ms: Option<u64>) -> UpstreamConfig {
    let mut config = upstream_config("up-1");
    config.failsafe = FailsafeConfig {
        hedge: Some(HedgePolicyConfig { delay_ms, max_count: 1 }),
        timeout: timeout_ms.map(|duration_ms| TimeoutPolicyConfig { duration_ms }),
        ..Default::default()
    };
    config
}

#[tokio::test]
async fn test_fast_primary_never_hedges() {
    let transport = ScriptedTransport::new().respond("eth_chainId", json!("0x1"));
    let upstream = build_upstream(hedged(200, None), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    let response =
        upstream.forward(&RequestContext::new(), &request("eth_chainId", json!([])), false).await.unwrap();

    let metadata = response.metadata();
    assert_eq!((metadata.attempts, metadata.hedges), (1, 0));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_hedge_wins_over_slow_primary() {
    let transport = ScriptedTransport::new().script(
        "eth_getBlockByNumber",
        vec![
            Step::ok(json!({"number": "0x1", "from": "primary"})).after(Duration::from_secs(2)),
            Step::ok(json!({"number": "0x1", "from": "hedge"})),
        ],
    );
    let upstream = build_upstream(hedged(30, None), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    let started = Instant::now();
    let response = upstream
        .forward(&RequestContext::new(), &request("eth_getBlockByNumber", json!(["0x1", false])), false)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.result().unwrap()["from"], "hedge");

    let metadata = response.metadata();
    assert_eq!((metadata.attempts, metadata.hedges, metadata.retries), (2, 1, 0));
    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.completed(), 1);
    assert_eq!(transport.cancelled(), 1, "the slow primary is dropped");
}

#[tokio::test]
async fn test_first_failure_settles_hedged_execution() {
    let transport = ScriptedTransport::new().script(
        "eth_call",
        vec![
            Step::ok(json!("0xslow")).after(Duration::from_secs(2)),
            Step::err(UpstreamError::HttpError(503, "unavailable".to_string())),
        ],
    );
    let upstream = build_upstream(hedged(30, None), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    let err = upstream.forward(&RequestContext::new(), &request("eth_call", json!([])), false).await.unwrap_err();

    assert_eq!(err.root().code(), "ErrEndpointServerSideException");
    assert_eq!(err.counters().map(|c| c.hedges), Some(1));
    assert_eq!(transport.cancelled(), 1);
}

#[tokio::test]
async fn test_timeout_cancels_every_hedge() {
    let transport = ScriptedTransport::new().respond_after("eth_call", json!("late"), Duration::from_secs(2));
    let upstream = build_upstream(hedged(20, Some(100)), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    let err = upstream.forward(&RequestContext::new(), &request("eth_call", json!([])), false).await.unwrap_err();

    assert_eq!(err.root().code(), "ErrEndpointRequestTimeout");
    let counters = err.counters().unwrap();
    assert_eq!((counters.attempts, counters.hedges), (2, 1));
    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.cancelled(), 2);
    assert_eq!(transport.completed(), 0);
}
