//! End-to-end dispatch over the real HTTP transport against mockito nodes.

use crate::mock_infrastructure::{build_dispatcher, inbound, mainnet, RpcMockBuilder};
use conduit_core::{
    config::{ProjectAdminConfig, ProjectAuthConfig, ProjectConfig, UpstreamConfig},
    context::RequestContext,
    project::Project,
    rate_limit::RateLimitersRegistry,
    utils::BufferPool,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

async fn project_over(nodes: &[(&str, &RpcMockBuilder)]) -> Project {
    let config = ProjectConfig {
        id: "main".to_string(),
        admin: ProjectAdminConfig::default(),
        auth: ProjectAuthConfig::default(),
        networks: vec![mainnet()],
        upstreams: nodes.iter().map(|(id, node)| UpstreamConfig::new(*id, node.url())).collect(),
    };
    let limiters = Arc::new(RateLimitersRegistry::new(&Default::default()).unwrap());
    Project::bootstrap(&config, limiters, BufferPool::new(16), None).await.unwrap()
}

#[tokio::test]
async fn test_chain_id_detected_then_request_served() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_chain_id(1).mock_block_number(0x1234);

    let project = project_over(&[("node-1", &node)]).await;
    assert_eq!(project.upstreams().get("node-1").unwrap().config().evm.chain_id, Some(1));
    assert_eq!(project.network("evm:1").unwrap().upstreams().len(), 1);

    let dispatcher = build_dispatcher(project, Duration::from_secs(5));
    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":7,"method":"eth_blockNumber","params":[]}"#))
        .await;

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, json!({"jsonrpc": "2.0", "id": 7, "result": "0x1234"}));
    assert!(node.verify_all_called());
}

#[tokio::test]
async fn test_node_on_other_chain_is_not_assigned() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_chain_id(137);

    let project = project_over(&[("polygon", &node)]).await;
    assert!(project.network("evm:1").unwrap().upstreams().is_empty());
}

#[tokio::test]
async fn test_provider_throttling_maps_to_429() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_chain_id(1).mock_rate_limited("eth_call", 7);

    let project = project_over(&[("node-1", &node)]).await;
    let dispatcher = build_dispatcher(project, Duration::from_secs(5));
    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_call","params":[]}"#))
        .await;

    assert_eq!(outcome.status, 429);
    assert_eq!(outcome.retry_after, Some(Duration::from_secs(7)));
    assert_eq!(outcome.body["error"]["code"], -32005);
}

#[tokio::test]
async fn test_server_error_fails_over_to_next_node() {
    let mut broken = RpcMockBuilder::new().await;
    broken.mock_chain_id(1).mock_server_error("eth_blockNumber");
    let mut healthy = RpcMockBuilder::new().await;
    healthy.mock_chain_id(1).mock_block_number(0x10);

    let project = project_over(&[("broken", &broken), ("healthy", &healthy)]).await;
    let dispatcher = build_dispatcher(project, Duration::from_secs(5));
    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber"}"#))
        .await;

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body["result"], "0x10");
    assert_eq!(outcome.metadata.unwrap().upstream.as_deref(), Some("healthy"));
    assert!(broken.verify_all_called());
}

#[tokio::test]
async fn test_execution_error_is_passed_through() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_chain_id(1).mock_rpc_error("eth_call", 3, "execution reverted");
    let mut spare = RpcMockBuilder::new().await;
    spare.mock_chain_id(1);

    let project = project_over(&[("node-1", &node), ("spare", &spare)]).await;
    let dispatcher = build_dispatcher(project, Duration::from_secs(5));
    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_call","params":[]}"#))
        .await;

    assert_eq!(outcome.status, 400);
    assert_eq!(outcome.body["error"]["code"], 3);
    assert_eq!(outcome.body["error"]["message"], "execution reverted");
}

#[tokio::test]
async fn test_revert_data_reaches_the_client() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_chain_id(1).mock_rpc_error_with_data(
        "eth_call",
        3,
        "execution reverted",
        json!("0x08c379a0deadbeef"),
    );

    let project = project_over(&[("node-1", &node)]).await;
    let dispatcher = build_dispatcher(project, Duration::from_secs(5));
    let outcome = dispatcher
        .dispatch(&RequestContext::new(), inbound(r#"{"jsonrpc":"2.0","id":1,"method":"eth_call","params":[]}"#))
        .await;

    assert_eq!(outcome.status, 400);
    assert_eq!(
        outcome.body["error"],
        json!({"code": 3, "message": "execution reverted", "data": "0x08c379a0deadbeef"})
    );
}
