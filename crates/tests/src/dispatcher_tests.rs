//! Integration tests for the request dispatcher.
//!
//! These tests verify that:
//! - Batch responses keep input order whatever the per-item latency
//! - A failing or malformed item never affects its siblings
//! - Every item runs under its own deadline
//! - Singletons carry metadata and a matching HTTP status

use crate::mock_infrastructure::{
    build_dispatcher, build_dispatcher_with_metrics, build_project, inbound, upstream_config,
    ScriptedTransport, Step,
};
use conduit_core::{
    auth::AuthPayload, context::RequestContext, metrics::MetricsCollector,
    upstream::{UpstreamError, UpstreamTransport},
};
use serde_json::json;
use serial_test::serial;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

async fn dispatcher_over(transport: Arc<ScriptedTransport>, max_timeout: Duration) -> conduit_core::dispatcher::Dispatcher {
    let project = build_project(
        vec![],
        vec![(upstream_config("up-1"), transport as Arc<dyn UpstreamTransport>)],
    )
    .await;
    build_dispatcher(project, max_timeout)
}

#[tokio::test]
async fn test_batch_preserves_order_with_mixed_latency() {
    let transport = ScriptedTransport::new()
        .respond_after("eth_slow", json!("slow"), Duration::from_millis(150))
        .respond("eth_fast", json!("fast"));
    let dispatcher = dispatcher_over(transport, Duration::from_secs(5)).await;

    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"eth_slow"},
        {"jsonrpc":"2.0","id":2,"method":"eth_fast"},
        {"jsonrpc":"2.0","id":3},
        {"jsonrpc":"2.0","id":"four","method":"eth_fast"}
    ]"#;
    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(body)).await;

    assert!(outcome.is_batch);
    assert_eq!(outcome.status, 200);
    assert!(outcome.metadata.is_none());

    let items = outcome.body.as_array().unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], json!({"jsonrpc": "2.0", "id": 1, "result": "slow"}));
    assert_eq!(items[1]["id"], 2);
    assert_eq!(items[1]["result"], "fast");
    assert_eq!(items[2]["id"], 3);
    assert_eq!(items[2]["error"]["code"], -32600);
    assert_eq!(items[3]["id"], "four");
    assert_eq!(items[3]["result"], "fast");
}

#[tokio::test]
async fn test_batch_items_run_concurrently() {
    let transport =
        ScriptedTransport::new().respond_after("eth_slow", json!("slow"), Duration::from_millis(200));
    let dispatcher = dispatcher_over(Arc::clone(&transport), Duration::from_secs(5)).await;

    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"eth_slow"},
        {"jsonrpc":"2.0","id":2,"method":"eth_slow"},
        {"jsonrpc":"2.0","id":3,"method":"eth_slow"}
    ]"#;
    let started = Instant::now();
    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(body)).await;

    assert_eq!(outcome.body.as_array().unwrap().len(), 3);
    assert_eq!(transport.calls_for("eth_slow"), 3);
    assert!(started.elapsed() < Duration::from_millis(550), "items must not run one after another");
}

#[tokio::test]
async fn test_failing_item_does_not_affect_siblings() {
    let transport = ScriptedTransport::new()
        .script("eth_call", vec![Step::err(UpstreamError::HttpError(500, "boom".to_string()))])
        .respond("eth_getBalance", json!("0x64"));
    let dispatcher = dispatcher_over(transport, Duration::from_secs(5)).await;

    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"eth_call","params":[]},
        {"jsonrpc":"2.0","id":2,"method":"eth_getBalance","params":[]}
    ]"#;
    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(body)).await;

    let items = outcome.body.as_array().unwrap();
    assert_eq!(outcome.status, 200);
    assert!(items[0].get("error").is_some());
    assert!(items[0].get("result").is_none());
    assert_eq!(items[1]["result"], "0x64");
}

#[tokio::test]
async fn test_panicking_item_does_not_take_down_batch() {
    let transport = ScriptedTransport::new().panic_on("eth_call").respond("eth_chainId", json!("0x1"));
    let dispatcher = dispatcher_over(Arc::clone(&transport), Duration::from_secs(5)).await;

    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"eth_call","params":[]},
        {"jsonrpc":"2.0","id":2,"method":"eth_chainId"}
    ]"#;
    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(body)).await;

    assert_eq!(outcome.status, 200);
    let items = outcome.body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], 1);
    assert_eq!(items[0]["error"]["code"], -32603);
    assert_eq!(items[0]["error"]["message"], "internal error: request worker panicked");
    assert_eq!(items[1], json!({"jsonrpc": "2.0", "id": 2, "result": "0x1"}));
}

#[tokio::test]
async fn test_each_item_gets_its_own_deadline() {
    let transport = ScriptedTransport::new()
        .respond_after("eth_stuck", json!("late"), Duration::from_secs(5))
        .respond("eth_fast", json!("fast"));
    let dispatcher = dispatcher_over(Arc::clone(&transport), Duration::from_millis(100)).await;

    let body = r#"[
        {"jsonrpc":"2.0","id":1,"method":"eth_stuck"},
        {"jsonrpc":"2.0","id":2,"method":"eth_fast"}
    ]"#;
    let started = Instant::now();
    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(body)).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    let items = outcome.body.as_array().unwrap();
    assert!(items[0].get("error").is_some());
    assert_eq!(items[1]["result"], "fast");
    assert_eq!(transport.cancelled(), 1, "the stuck send is abandoned");
}

#[tokio::test]
async fn test_singleton_timeout_status() {
    let transport =
        ScriptedTransport::new().respond_after("eth_stuck", json!("late"), Duration::from_secs(5));
    let dispatcher = dispatcher_over(transport, Duration::from_millis(50)).await;

    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_stuck"}"#))
        .await;

    assert_eq!(outcome.status, 504);
}

#[tokio::test]
async fn test_singleton_carries_metadata() {
    let transport = ScriptedTransport::new().respond("eth_blockNumber", json!("0x10"));
    let dispatcher = dispatcher_over(transport, Duration::from_secs(5)).await;

    let outcome = dispatcher
        .dispatch(
            &RequestContext::new(),
            inbound(r#"{"jsonrpc":"2.0","id":"abc","method":"eth_blockNumber"}"#),
        )
        .await;

    assert!(!outcome.is_batch);
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, json!({"jsonrpc": "2.0", "id": "abc", "result": "0x10"}));

    let metadata = outcome.metadata.unwrap();
    assert_eq!(metadata.upstream.as_deref(), Some("up-1"));
    assert_eq!(metadata.attempts, 1);
    assert_eq!(metadata.retries, 0);
    assert_eq!(metadata.hedges, 0);
    assert!(!metadata.from_cache);
}

#[tokio::test]
async fn test_malformed_payloads() {
    let dispatcher = dispatcher_over(ScriptedTransport::new(), Duration::from_secs(5)).await;

    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound("[{\"id\":1,")).await;
    assert_eq!(outcome.status, 400);
    assert_eq!(outcome.body["error"]["code"], -32600);

    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound("{not json")).await;
    assert_eq!(outcome.status, 400);
    assert_eq!(outcome.body["id"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_empty_batch_is_a_single_invalid_request() {
    let dispatcher = dispatcher_over(ScriptedTransport::new(), Duration::from_secs(5)).await;

    let outcome = dispatcher.dispatch(&RequestContext::new(), inbound(" [ ] ")).await;

    assert!(!outcome.is_batch);
    assert_eq!(outcome.status, 400);
    assert!(outcome.body.is_object());
    assert_eq!(outcome.body["id"], serde_json::Value::Null);
    assert_eq!(outcome.body["error"]["code"], -32600);
}

#[tokio::test]
async fn test_network_id_in_body_routes_the_item() {
    let transport = ScriptedTransport::new().respond("eth_chainId", json!("0x1"));
    let dispatcher = dispatcher_over(Arc::clone(&transport), Duration::from_secs(5)).await;

    let mut request = inbound(r#"{"jsonrpc":"2.0","id":5,"networkId":"evm:1","method":"eth_chainId"}"#);
    request.network_id = None;
    let outcome = dispatcher.dispatch(&RequestContext::new(), request).await;

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, json!({"jsonrpc": "2.0", "id": 5, "result": "0x1"}));
}

#[tokio::test]
async fn test_unknown_project_and_network() {
    let dispatcher = dispatcher_over(ScriptedTransport::new(), Duration::from_secs(5)).await;

    let mut request = inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_x"}"#);
    request.project_id = "missing".to_string();
    let outcome = dispatcher.dispatch(&RequestContext::new(), request).await;
    assert_eq!(outcome.status, 404);

    let mut request = inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_x"}"#);
    request.network_id = Some("evm:10".to_string());
    let outcome = dispatcher.dispatch(&RequestContext::new(), request).await;
    assert_eq!(outcome.status, 404);
}

#[tokio::test]
async fn test_authentication_per_item() {
    let transport = ScriptedTransport::new();
    let project = build_project(
        vec!["s3cret".to_string()],
        vec![(upstream_config("up-1"), Arc::clone(&transport) as Arc<dyn UpstreamTransport>)],
    )
    .await;
    let dispatcher = build_dispatcher(project, Duration::from_secs(5));

    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_x"}"#))
        .await;
    assert_eq!(outcome.status, 401);
    assert_eq!(transport.calls_for("eth_x"), 0);

    let mut request = inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_x"}"#);
    request.auth = AuthPayload::from_parts(Some("s3cret"), None);
    let outcome = dispatcher.dispatch(&RequestContext::new(), request).await;
    assert_eq!(outcome.status, 200);
}

#[tokio::test]
#[serial]
async fn test_batch_metric_is_recorded() {
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let project = build_project(
        vec![],
        vec![(upstream_config("up-1"), ScriptedTransport::new() as Arc<dyn UpstreamTransport>)],
    )
    .await;
    let dispatcher = build_dispatcher_with_metrics(project, Arc::clone(&metrics));

    dispatcher
        .dispatch(
            &RequestContext::new(),
            inbound(r#"[{"jsonrpc":"2.0","id":1,"method":"eth_x"},{"jsonrpc":"2.0","id":2,"method":"eth_y"}]"#),
        )
        .await;

    assert!(metrics.render().contains("conduit_batch_requests_total"));
}
