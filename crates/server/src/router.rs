use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use conduit_core::{
    auth::{AuthPayload, SECRET_TOKEN_HEADER, SECRET_TOKEN_QUERY},
    config::ServerConfig,
    context::RequestContext,
    dispatcher::{directives_from_parts, DispatchOutcome, Dispatcher, InboundRequest},
    errors::GatewayError,
    metrics::MetricsCollector,
    normalizer::normalize_error,
    types::{CacheStatus, EvmSyncingState, NetworkArchitecture},
    upstream::UpstreamStatus,
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{compression::CompressionLayer, limit::RequestBodyLimitLayer};
use tracing::debug;

pub const USE_UPSTREAM_HEADER: &str = "x-conduit-use-upstream";
pub const USE_UPSTREAM_QUERY: &str = "use-upstream";
pub const RETRY_EMPTY_HEADER: &str = "x-conduit-retry-empty";
pub const RETRY_EMPTY_QUERY: &str = "retry-empty";

const CACHE_HEADER: HeaderName = HeaderName::from_static("x-conduit-cache");
const UPSTREAM_HEADER: HeaderName = HeaderName::from_static("x-conduit-upstream");
const ATTEMPTS_HEADER: HeaderName = HeaderName::from_static("x-conduit-attempts");
const RETRIES_HEADER: HeaderName = HeaderName::from_static("x-conduit-retries");
const HEDGES_HEADER: HeaderName = HeaderName::from_static("x-conduit-hedges");

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub metrics: Option<Arc<MetricsCollector>>,
}

/// Builds the full router: public health and metrics routes plus the limited RPC routes.
pub fn create_app(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let public = Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(Arc::clone(&state));

    let rpc = Router::new()
        .route("/{project}", post(handle_project_rpc))
        .route("/{project}/admin", post(handle_admin_rpc))
        .route("/{project}/{architecture}/{chain_id}", post(handle_network_rpc))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(server.max_concurrent_requests))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(CompressionLayer::new());

    public.merge(rpc)
}

/// Handles requests whose network is in the path, e.g. `POST /main/evm/1`.
pub async fn handle_network_rpc(
    State(state): State<Arc<AppState>>,
    Path((project, architecture, chain_id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let network_id = match network_id_from_path(&architecture, &chain_id) {
        Ok(network_id) => network_id,
        Err(err) => return reject(err),
    };

    let inbound = inbound_request(project, Some(network_id), false, &query, &headers, body);
    dispatch(&state, inbound).await
}

/// Handles requests that name their network per item in a `networkId` field.
pub async fn handle_project_rpc(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = inbound_request(project, None, false, &query, &headers, body);
    dispatch(&state, inbound).await
}

pub async fn handle_admin_rpc(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = inbound_request(project, None, true, &query, &headers, body);
    dispatch(&state, inbound).await
}

fn network_id_from_path(architecture: &str, chain_id: &str) -> Result<String, GatewayError> {
    let architecture: NetworkArchitecture = architecture.parse()?;
    let chain_id: u64 = chain_id
        .parse()
        .map_err(|_| GatewayError::InvalidUrlPath(format!("invalid chain id: {chain_id}")))?;
    Ok(format!("{architecture}:{chain_id}"))
}

/// Header values win over query parameters.
fn inbound_request(
    project_id: String,
    network_id: Option<String>,
    admin: bool,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> InboundRequest {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let param = |name: &str| query.get(name).map(String::as_str);

    InboundRequest {
        project_id,
        network_id,
        admin,
        directives: directives_from_parts(
            header(USE_UPSTREAM_HEADER).or_else(|| param(USE_UPSTREAM_QUERY)),
            header(RETRY_EMPTY_HEADER).or_else(|| param(RETRY_EMPTY_QUERY)),
        ),
        auth: AuthPayload::from_parts(header(SECRET_TOKEN_HEADER), param(SECRET_TOKEN_QUERY)),
        body,
    }
}

async fn dispatch(state: &AppState, inbound: InboundRequest) -> Response {
    let ctx = RequestContext::new();
    // A client that disconnects drops this future; cancel everything still in flight.
    let guard = ctx.token().clone().drop_guard();
    let outcome = state.dispatcher.dispatch(&ctx, inbound).await;
    guard.disarm();

    debug!(status = outcome.status, batch = outcome.is_batch, "request dispatched");
    into_http_response(outcome)
}

fn reject(err: GatewayError) -> Response {
    let outcome = normalize_error(&Value::Null, err);
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Json(outcome.body)).into_response()
}

fn into_http_response(outcome: DispatchOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(outcome.body)).into_response();
    let headers = response.headers_mut();

    if let Some(metadata) = &outcome.metadata {
        let cache = match metadata.cache_status() {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        };
        headers.insert(CACHE_HEADER, HeaderValue::from_static(cache));
        if let Some(upstream) = metadata.upstream.as_deref().and_then(|u| HeaderValue::from_str(u).ok()) {
            headers.insert(UPSTREAM_HEADER, upstream);
        }
        headers.insert(ATTEMPTS_HEADER, HeaderValue::from(metadata.attempts));
        headers.insert(RETRIES_HEADER, HeaderValue::from(metadata.retries));
        headers.insert(HEDGES_HEADER, HeaderValue::from(metadata.hedges));
    }

    if let Some(wait) = outcome.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
    }

    response
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
}

#[allow(clippy::unused_async)]
pub async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics are disabled".to_string(),
        ),
    }
}

fn is_available(status: &UpstreamStatus) -> bool {
    status.circuit_breaker != Some("open") && status.syncing != EvmSyncingState::Syncing
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut projects: Vec<_> = state.dispatcher.projects().projects().collect();
    projects.sort_by(|a, b| a.id().cmp(b.id()));

    let mut total = 0usize;
    let mut available = 0usize;
    let mut report = Vec::with_capacity(projects.len());
    for project in projects {
        let mut upstreams = Vec::with_capacity(project.upstreams().len());
        for upstream in project.upstreams().all() {
            upstreams.push(upstream.status().await);
        }
        total += upstreams.len();
        available += upstreams.iter().filter(|s| is_available(s)).count();
        report.push(json!({ "id": project.id(), "upstreams": upstreams }));
    }

    let status = if available == 0 {
        "unhealthy"
    } else if available < total {
        "degraded"
    } else {
        "healthy"
    };

    let health_status = json!({
        "status": status,
        "upstreams": { "total": total, "available": available },
        "projects": report,
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    (
        if available > 0 { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE },
        [("content-type", "application/json")],
        serde_json::to_string(&health_status).unwrap_or_default(),
    )
}
