//! Integration tests for network-level failover and block availability.

use crate::mock_infrastructure::{
    build_network, build_upstream, request_on, upstream_config, ScriptedTransport, Step,
};
use conduit_core::{
    context::RequestContext,
    errors::GatewayError,
    types::EvmNodeType,
    upstream::{UpstreamError, UpstreamTransport},
};
use serde_json::json;
use std::sync::Arc;

fn full_node(id: &str, max_available_recent_blocks: u64) -> conduit_core::config::UpstreamConfig {
    let mut config = upstream_config(id);
    config.evm.node_type = EvmNodeType::Full;
    config.evm.max_available_recent_blocks = max_available_recent_blocks;
    config
}

fn archive_node(id: &str) -> conduit_core::config::UpstreamConfig {
    let mut config = upstream_config(id);
    config.evm.node_type = EvmNodeType::Archive;
    config
}

#[tokio::test]
async fn test_full_node_skipped_for_pruned_blocks() {
    let full = ScriptedTransport::new();
    let archive = ScriptedTransport::new();
    let network = build_network(
        vec![
            build_upstream(full_node("full", 100), Arc::clone(&full) as Arc<dyn UpstreamTransport>, None),
            build_upstream(archive_node("archive"), Arc::clone(&archive) as Arc<dyn UpstreamTransport>, None),
        ],
        1_000,
    );

    let cases = [
        ("0x352", "archive"), // 850: older than 1000 - 100
        ("0x3b6", "full"),    // 950: still within the recent window
        ("0x5dc", "full"),    // 1500: past the known head, not decidable
        ("latest", "full"),
    ];

    for (block, expected) in cases {
        let req = request_on(&network, "eth_getBlockByNumber", json!([block, false]));
        let response = network.forward(&RequestContext::new(), &req).await.unwrap();
        assert_eq!(response.metadata().upstream.as_deref(), Some(expected), "block {block}");
    }

    assert_eq!(full.calls(), 3);
    assert_eq!(archive.calls(), 1);
}

#[tokio::test]
async fn test_unknown_head_never_skips() {
    let full = ScriptedTransport::new();
    let network = build_network(
        vec![build_upstream(full_node("full", 100), Arc::clone(&full) as Arc<dyn UpstreamTransport>, None)],
        0,
    );

    let req = request_on(&network, "eth_getBlockByNumber", json!(["0x1", false]));
    assert!(network.forward(&RequestContext::new(), &req).await.is_ok());
    assert_eq!(full.calls(), 1);
}

#[tokio::test]
async fn test_failover_in_configured_order() {
    let first = ScriptedTransport::new()
        .script("eth_call", vec![Step::err(UpstreamError::HttpError(503, "unavailable".to_string()))]);
    let second = ScriptedTransport::new().respond("eth_call", json!("0xbeef"));
    let third = ScriptedTransport::new();
    let network = build_network(
        vec![
            build_upstream(upstream_config("first"), Arc::clone(&first) as Arc<dyn UpstreamTransport>, None),
            build_upstream(upstream_config("second"), Arc::clone(&second) as Arc<dyn UpstreamTransport>, None),
            build_upstream(upstream_config("third"), Arc::clone(&third) as Arc<dyn UpstreamTransport>, None),
        ],
        0,
    );

    let req = request_on(&network, "eth_call", json!([{"to": "0x1"}, "latest"]));
    let response = network.forward(&RequestContext::new(), &req).await.unwrap();

    assert_eq!(response.result(), Some(&json!("0xbeef")));
    assert_eq!(response.metadata().upstream.as_deref(), Some("second"));
    assert_eq!(req.last_upstream().as_deref(), Some("second"));
    assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
}

#[tokio::test]
async fn test_exhausted_network_reports_every_upstream() {
    let failing = |status| {
        ScriptedTransport::new()
            .script("eth_call", vec![Step::err(UpstreamError::HttpError(status, "down".to_string()))])
    };
    let network = build_network(
        vec![
            build_upstream(upstream_config("a"), failing(500) as Arc<dyn UpstreamTransport>, None),
            build_upstream(upstream_config("b"), failing(502) as Arc<dyn UpstreamTransport>, None),
        ],
        0,
    );

    let req = request_on(&network, "eth_call", json!([]));
    let err = network.forward(&RequestContext::new(), &req).await.unwrap_err();

    match &err {
        GatewayError::UpstreamsExhausted { network, errors, counters } => {
            assert_eq!(network, "evm:1");
            let ids: Vec<_> = errors.iter().map(|(id, _)| id.as_str()).collect();
            assert_eq!(ids, ["a", "b"]);
            assert_eq!(counters.attempts, 2);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(err.status_code(), 503);
    assert_eq!(err.error_body().code, -32603);
}

#[tokio::test]
async fn test_client_side_error_stops_failover() {
    let first = ScriptedTransport::new().script(
        "eth_call",
        vec![Step::err(UpstreamError::rpc(3, "execution reverted"))],
    );
    let second = ScriptedTransport::new();
    let network = build_network(
        vec![
            build_upstream(upstream_config("first"), Arc::clone(&first) as Arc<dyn UpstreamTransport>, None),
            build_upstream(upstream_config("second"), Arc::clone(&second) as Arc<dyn UpstreamTransport>, None),
        ],
        0,
    );

    let req = request_on(&network, "eth_call", json!([]));
    let err = network.forward(&RequestContext::new(), &req).await.unwrap_err();

    assert!(err.is_client_side());
    assert_eq!(err.error_body().message, "execution reverted");
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn test_all_capacity_errors_map_to_429() {
    let throttled = || {
        ScriptedTransport::new().script(
            "eth_call",
            vec![Step::err(UpstreamError::CapacityExceeded {
                message: "rate limited".to_string(),
                retry_after: Some(std::time::Duration::from_secs(3)),
            })],
        )
    };
    let network = build_network(
        vec![
            build_upstream(upstream_config("a"), throttled() as Arc<dyn UpstreamTransport>, None),
            build_upstream(upstream_config("b"), throttled() as Arc<dyn UpstreamTransport>, None),
        ],
        0,
    );

    let req = request_on(&network, "eth_call", json!([]));
    let err = network.forward(&RequestContext::new(), &req).await.unwrap_err();

    assert!(err.is_capacity_exceeded());
    assert_eq!(err.status_code(), 429);
}

#[tokio::test]
async fn test_cancelled_caller_returns_without_trying_upstreams() {
    let transport = ScriptedTransport::new();
    let network = build_network(
        vec![build_upstream(upstream_config("up-1"), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None)],
        0,
    );
    let ctx = RequestContext::new();
    ctx.cancel();

    let req = request_on(&network, "eth_chainId", json!([]));
    let err = network.forward(&ctx, &req).await.unwrap_err();

    assert!(matches!(err, GatewayError::RequestCanceled));
    assert_eq!(err.status_code(), 499);
    assert_eq!(transport.calls(), 0);
}
