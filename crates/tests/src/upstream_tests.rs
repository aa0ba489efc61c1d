//! Integration tests for a single upstream: eligibility, method memo and rate budgets.

use crate::mock_infrastructure::{
    build_network, build_upstream, rate_limiters, request, request_on, rule, upstream_config,
    ScriptedTransport, Step,
};
use conduit_core::{
    config::{RateLimitAutoTuneConfig, RateLimitBudgetConfig},
    context::RequestContext,
    errors::GatewayError,
    types::{EvmSyncingState, RequestDirectives},
    upstream::{UpstreamError, UpstreamTransport},
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_syncing_upstream_is_skipped_without_any_call() {
    let syncing = ScriptedTransport::new();
    let healthy = ScriptedTransport::new().respond("eth_getBalance", json!("0x1"));
    let first = build_upstream(upstream_config("syncing"), Arc::clone(&syncing) as Arc<dyn UpstreamTransport>, None);
    let second = build_upstream(upstream_config("healthy"), Arc::clone(&healthy) as Arc<dyn UpstreamTransport>, None);
    first.set_syncing_state(EvmSyncingState::Syncing);

    let network = build_network(vec![first, second], 0);
    let req = request_on(&network, "eth_getBalance", json!(["0xabc", "latest"]));
    let response = network.forward(&RequestContext::new(), &req).await.unwrap();

    assert_eq!(response.metadata().upstream.as_deref(), Some("healthy"));
    assert_eq!(syncing.calls(), 0);
    assert_eq!(healthy.calls(), 1);
}

#[tokio::test]
async fn test_bypass_reaches_syncing_upstream() {
    let transport = ScriptedTransport::new().respond("eth_syncing", json!(true));
    let upstream = build_upstream(upstream_config("up-1"), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);
    upstream.set_syncing_state(EvmSyncingState::Syncing);

    let req = request("eth_syncing", json!([]));
    let err = upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();
    assert!(err.is_skip());
    assert_eq!(err.root().code(), "ErrUpstreamSyncing");

    let response = upstream.forward(&RequestContext::new(), &req, true).await.unwrap();
    assert_eq!(response.result(), Some(&json!(true)));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_unsupported_method_is_ignored_and_memo_evicted() {
    let transport = ScriptedTransport::new().script(
        "trace_block",
        vec![Step::err(UpstreamError::rpc(-32601, "the method trace_block does not exist"))],
    );
    let mut config = upstream_config("up-1");
    config.auto_ignore_unsupported_methods = true;
    let upstream = build_upstream(config, Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    assert!(upstream.should_handle_method("trace_block").unwrap(), "memoized as allowed");

    let req = request("trace_block", json!(["latest"]));
    let err = upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();
    assert_eq!(err.root().code(), "ErrEndpointUnsupported");

    assert!(!upstream.should_handle_method("trace_block").unwrap(), "stale memo entry was evicted");
    assert!(upstream.config().ignore_methods.iter().any(|m| m == "trace_block"));

    let err = upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();
    assert!(err.is_skip());
    assert_eq!(transport.calls_for("trace_block"), 1);
}

#[tokio::test]
async fn test_unsupported_method_kept_without_auto_ignore() {
    let transport = ScriptedTransport::new().script(
        "trace_block",
        vec![Step::err(UpstreamError::rpc(-32601, "method not found"))],
    );
    let upstream = build_upstream(upstream_config("up-1"), transport as Arc<dyn UpstreamTransport>, None);

    let req = request("trace_block", json!([]));
    assert!(upstream.forward(&RequestContext::new(), &req, false).await.is_err());
    assert!(upstream.should_handle_method("trace_block").unwrap());
}

#[tokio::test]
async fn test_use_upstream_directive() {
    let transport = ScriptedTransport::new();
    let upstream = build_upstream(upstream_config("alchemy-1"), Arc::clone(&transport) as Arc<dyn UpstreamTransport>, None);

    let req = request("eth_chainId", json!([]));
    req.set_directives(RequestDirectives { use_upstream: Some("infura-*".to_string()), retry_empty: true });
    let err = upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();
    assert_eq!(err.root().code(), "ErrUpstreamNotAllowed");

    req.set_directives(RequestDirectives { use_upstream: Some("alchemy-*".to_string()), retry_empty: true });
    assert!(upstream.forward(&RequestContext::new(), &req, false).await.is_ok());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_first_denied_rule_stops_evaluation() {
    let limiters = rate_limiters(vec![RateLimitBudgetConfig {
        id: "budget".to_string(),
        rules: vec![rule("eth_call", 1), rule("eth_*", 100)],
    }]);
    let transport = ScriptedTransport::new();
    let mut config = upstream_config("up-1");
    config.rate_limit_budget = Some("budget".to_string());
    let upstream = build_upstream(config, Arc::clone(&transport) as Arc<dyn UpstreamTransport>, Some(Arc::clone(&limiters)));

    let req = request("eth_call", json!([]));
    upstream.forward(&RequestContext::new(), &req, false).await.unwrap();

    let err = upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();
    match &err {
        GatewayError::UpstreamRateLimitRuleExceeded { budget, rule, retry_after, .. } => {
            assert_eq!(budget, "budget");
            assert!(rule.starts_with("eth_call"));
            assert!(retry_after.is_some());
        }
        other => panic!("expected a rate limit error, got {other:?}"),
    }
    assert_eq!(err.status_code(), 429);
    assert_eq!(transport.calls(), 1, "a denied request never reaches the transport");

    let budget = limiters.get_budget("budget").unwrap();
    assert_eq!(budget.rules()[1].limiter().available_permits(), 99, "later rules keep their permits");
}

#[tokio::test]
async fn test_auto_tuner_adjusts_from_error_rate() {
    let limiters = rate_limiters(vec![RateLimitBudgetConfig {
        id: "budget".to_string(),
        rules: vec![rule("*", 100)],
    }]);
    let transport = ScriptedTransport::new().script(
        "eth_call",
        vec![
            Step::ok(json!("0x1")),
            Step::err(UpstreamError::CapacityExceeded { message: "slow down".to_string(), retry_after: None }),
        ],
    );
    let mut config = upstream_config("up-1");
    config.rate_limit_budget = Some("budget".to_string());
    config.rate_limit_auto_tune = RateLimitAutoTuneConfig {
        enabled: true,
        adjustment_period_ms: 3_600_000,
        error_rate_threshold: 0.1,
        increase_factor: 1.1,
        decrease_factor: 0.9,
        min_budget: 1,
        max_budget: 1_000,
    };
    let upstream = build_upstream(config, transport as Arc<dyn UpstreamTransport>, Some(Arc::clone(&limiters)));
    let tuner = Arc::clone(upstream.auto_tuner().unwrap());

    let req = request("eth_call", json!([]));
    upstream.forward(&RequestContext::new(), &req, false).await.unwrap();
    upstream.forward(&RequestContext::new(), &req, false).await.unwrap_err();

    let adjustments = tuner.adjust_budgets();
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].previous, 100);
    assert_eq!(adjustments[0].current, 90);

    upstream.forward(&RequestContext::new(), &req, false).await.unwrap();
    let adjustments = tuner.adjust_budgets();
    assert_eq!(adjustments[0].current, 99);

    assert!(tuner.adjust_budgets().is_empty(), "no samples, no change");
    assert_eq!(limiters.get_budget("budget").unwrap().rules()[0].limiter().capacity(), 99);
}

#[tokio::test]
async fn test_rate_limited_upstream_fails_over() {
    let limiters = rate_limiters(vec![RateLimitBudgetConfig {
        id: "tiny".to_string(),
        rules: vec![rule("*", 1)],
    }]);
    let mut limited = upstream_config("limited");
    limited.rate_limit_budget = Some("tiny".to_string());
    let first = build_upstream(limited, ScriptedTransport::new() as Arc<dyn UpstreamTransport>, Some(limiters));
    let second = build_upstream(upstream_config("spare"), ScriptedTransport::new() as Arc<dyn UpstreamTransport>, None);
    let network = build_network(vec![first, second], 0);

    for expected in ["limited", "spare", "spare"] {
        let req = request_on(&network, "eth_chainId", json!([]));
        let response = network.forward(&RequestContext::new(), &req).await.unwrap();
        assert_eq!(response.metadata().upstream.as_deref(), Some(expected));
    }
}
