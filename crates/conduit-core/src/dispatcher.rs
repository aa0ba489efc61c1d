//! Request dispatcher: one isolated worker per request item.
//!
//! A body whose first non-whitespace byte is `[` is a batch; anything else is a single
//! request. Every item runs on its own tokio task: decode, apply directives, authenticate,
//! resolve the network, forward, normalize. A panic in one item turns into a `-32603`
//! envelope for that item only. Batch responses keep the input order.

use bytes::Bytes;
use futures::future::join_all;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

use crate::{
    auth::AuthPayload,
    context::RequestContext,
    errors::GatewayError,
    metrics::MetricsCollector,
    normalizer::{internal_failure, normalize_error, normalize_success, NormalizedOutcome},
    project::{Project, ProjectsRegistry},
    types::{NormalizedRequest, RequestDirectives, ResponseMetadata},
};

/// Everything the transport layer extracted from one inbound HTTP request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub project_id: String,
    /// Network from the URL path (`architecture:chain_id`). Without it, each item must
    /// name its network in a `networkId` field.
    pub network_id: Option<String>,
    pub admin: bool,
    pub directives: RequestDirectives,
    pub auth: AuthPayload,
    pub body: Bytes,
}

/// Builds directives from header or query values, header first.
///
/// `retry_empty` stays enabled unless explicitly set to `false` or `0`.
#[must_use]
pub fn directives_from_parts(use_upstream: Option<&str>, retry_empty: Option<&str>) -> RequestDirectives {
    let mut directives = RequestDirectives::default();
    if let Some(pattern) = use_upstream.map(str::trim).filter(|p| !p.is_empty()) {
        directives.use_upstream = Some(pattern.to_string());
    }
    if let Some(flag) = retry_empty {
        directives.retry_empty = !matches!(flag.trim().to_ascii_lowercase().as_str(), "false" | "0");
    }
    directives
}

/// What the transport layer sends back.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: u16,
    pub body: Value,
    /// Metadata of a single request. Batches carry per-item metadata only in logs.
    pub metadata: Option<ResponseMetadata>,
    /// Set when a single request was rejected for capacity and the wait is known.
    pub retry_after: Option<Duration>,
    pub is_batch: bool,
}

#[derive(Debug, Clone)]
struct ItemScope {
    project: Arc<Project>,
    network_id: Option<String>,
    admin: bool,
    directives: RequestDirectives,
    auth: AuthPayload,
}

enum ItemSource {
    Raw(Bytes),
    Value(Value),
}

impl ItemSource {
    /// Decodes the item once. On failure the id is recovered best-effort for the envelope.
    fn decode(self) -> Result<NormalizedRequest, (Value, GatewayError)> {
        match self {
            Self::Raw(raw) => NormalizedRequest::from_bytes(raw.clone()).map_err(|err| {
                let id = serde_json::from_slice::<Value>(&raw).ok().map(|v| item_id(&v));
                (id.unwrap_or(Value::Null), err)
            }),
            Self::Value(value) => {
                let id = item_id(&value);
                NormalizedRequest::from_value(value).map_err(|err| (id, err))
            }
        }
    }
}

fn item_id(value: &Value) -> Value {
    value.get("id").cloned().unwrap_or(Value::Null)
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    projects: Arc<ProjectsRegistry>,
    max_timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        projects: Arc<ProjectsRegistry>,
        max_timeout: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self { projects, max_timeout, metrics }
    }

    #[must_use]
    pub fn projects(&self) -> &Arc<ProjectsRegistry> {
        &self.projects
    }

    pub async fn dispatch(&self, ctx: &RequestContext, inbound: InboundRequest) -> DispatchOutcome {
        let project = match self.projects.get(&inbound.project_id) {
            Ok(project) => project,
            Err(err) => return Self::single(normalize_error(&Value::Null, err)),
        };

        let scope = ItemScope {
            project,
            network_id: inbound.network_id,
            admin: inbound.admin,
            directives: inbound.directives,
            auth: inbound.auth,
        };

        if !is_batch(&inbound.body) {
            let outcome = self.run_items(ctx, &scope, vec![ItemSource::Raw(inbound.body)]).await.pop();
            return Self::single(outcome.unwrap_or_else(|| internal_failure(&Value::Null, "no outcome")));
        }

        let items = match serde_json::from_slice::<Vec<Value>>(&inbound.body) {
            Ok(items) => items,
            Err(e) => {
                let err = GatewayError::InvalidRequest(format!("failed to decode batch: {e}"));
                return Self::single(normalize_error(&Value::Null, err));
            }
        };

        if items.is_empty() {
            let err = GatewayError::InvalidRequest("empty batch".to_string());
            return Self::single(normalize_error(&Value::Null, err));
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_batch_request(items.len());
        }
        debug!(project = %scope.project.id(), items = items.len(), "dispatching batch");

        let outcomes = self.run_items(ctx, &scope, items.into_iter().map(ItemSource::Value).collect()).await;
        DispatchOutcome {
            status: 200,
            body: Value::Array(outcomes.into_iter().map(|o| o.body).collect()),
            metadata: None,
            retry_after: None,
            is_batch: true,
        }
    }

    fn single(outcome: NormalizedOutcome) -> DispatchOutcome {
        DispatchOutcome {
            status: outcome.status,
            retry_after: outcome.error.as_ref().and_then(GatewayError::retry_after),
            body: outcome.body,
            metadata: Some(outcome.metadata),
            is_batch: false,
        }
    }

    /// Spawns one task per item and joins them in input order.
    ///
    /// Items are decoded before spawning so a panicking worker can still be answered with
    /// the id it was sent with.
    async fn run_items(
        &self,
        ctx: &RequestContext,
        scope: &ItemScope,
        items: Vec<ItemSource>,
    ) -> Vec<NormalizedOutcome> {
        let mut ids = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let request = match item.decode() {
                Ok(request) => {
                    request.set_directives(scope.directives.clone());
                    ids.push((*request.id()).clone());
                    Ok(request)
                }
                Err((id, err)) => {
                    ids.push(id.clone());
                    Err((id, err))
                }
            };
            let scope = scope.clone();
            let item_ctx = ctx.child(Some(self.max_timeout));
            handles.push(tokio::spawn(async move {
                match request {
                    Ok(request) => handle_item(item_ctx, scope, request).await,
                    Err((id, err)) => normalize_error(&id, err),
                }
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, id)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "request worker failed");
                    internal_failure(&id, "request worker panicked")
                }
            })
            .collect()
    }
}

async fn handle_item(ctx: RequestContext, scope: ItemScope, request: NormalizedRequest) -> NormalizedOutcome {
    let id = (*request.id()).clone();
    match process(&ctx, &scope, &request).await {
        Ok(response) => normalize_success(&id, &response),
        Err(err) => normalize_error(&id, err),
    }
}

async fn process(
    ctx: &RequestContext,
    scope: &ItemScope,
    request: &NormalizedRequest,
) -> Result<crate::types::NormalizedResponse, GatewayError> {
    scope.project.authenticate(ctx, request, &scope.auth, scope.admin).await?;

    if scope.admin {
        return scope.project.admin_request(request).await;
    }

    let network_id = scope.network_id.clone().or_else(|| request.body_network_id()).ok_or_else(|| {
        GatewayError::InvalidUrlPath(
            "network is required in the path (/{project}/{architecture}/{chain_id}) or as networkId"
                .to_string(),
        )
    })?;

    scope.project.forward(ctx, &network_id, request).await
}

/// Returns `true` if the first non-whitespace byte opens a JSON array.
#[must_use]
pub fn is_batch(body: &[u8]) -> bool {
    body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[')
}
