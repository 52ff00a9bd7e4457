//! The inbound HTTP surface: the proxy pipeline and the health status of
//! every cluster gateway.
//!
//! The [`router`] is plain axum and can be served by any server. The
//! gateway serves it through [`crate::server::GatewayServer`].
use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    middleware,
    response::Response,
    routing::{any, get},
};
use serde::Deserialize;
use snafu::ResultExt;
use tower_http::trace::TraceLayer;
use tracing::{Span, info_span};

use crate::{
    constants::{ADDON_NAME, GATEWAY_API_GROUP, GATEWAY_API_VERSION, GATEWAY_RESOURCE},
    health::HealthRecord,
    identity::IdentityExchanger,
    proxy::error::ReadHealthSnafu,
    resolver::Resolver,
    store::SharedRecordStore,
    transport::TransportBuilder,
};

pub mod authn;
pub mod authz;
pub mod error;
pub mod escape;
pub mod forward;
pub mod metrics;

pub use self::{
    authn::PeerVerified,
    authz::{AlwaysAllow, Authorizer, SubjectAccessReviewAuthorizer},
    error::ProxyError,
    metrics::{InMemoryMetrics, ProxyMetrics, TracingMetrics},
};

/// Everything the request handlers share. Cloned per request.
#[derive(Clone)]
pub struct ProxyState {
    pub store: SharedRecordStore,
    pub resolver: Arc<Resolver>,
    pub transports: Arc<TransportBuilder>,
    pub exchanger: Arc<IdentityExchanger>,

    /// Requests are authorized against their backend path when set.
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub metrics: Arc<dyn ProxyMetrics>,

    /// Exchanges the caller identity even without `impersonate=true`.
    pub impersonate_by_default: bool,
}

#[derive(Debug, Deserialize)]
struct ClusterPath {
    name: String,
}

pub fn router(state: ProxyState) -> Router {
    let resource = format!("/apis/{GATEWAY_API_GROUP}/{GATEWAY_API_VERSION}/{GATEWAY_RESOURCE}/{{name}}");

    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "http_request",
            http.request.method = %request.method(),
            url.path = request.uri().path(),
            http.response.status_code = tracing::field::Empty,
        )
    })
    .on_response(|response: &Response, _latency: Duration, span: &Span| {
        span.record("http.response.status_code", response.status().as_u16());
    });

    Router::new()
        .route(&format!("{resource}/proxy"), any(proxy))
        .route(&format!("{resource}/proxy/{{*path}}"), any(proxy))
        .route(&format!("{resource}/health"), get(health))
        .layer(trace_layer)
        .layer(middleware::from_fn(escape::escape_proxy_queries))
        // The liveness route is below the trace layer so as not to be instrumented
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn proxy(
    State(state): State<ProxyState>,
    Path(ClusterPath { name }): Path<ClusterPath>,
    request: Request,
) -> Response {
    forward::handle(state, name, request).await
}

async fn health(
    State(state): State<ProxyState>,
    Path(ClusterPath { name }): Path<ClusterPath>,
) -> Result<Json<HealthRecord>, ProxyError> {
    let addon = state
        .store
        .get_addon(&name, ADDON_NAME)
        .await
        .context(ReadHealthSnafu { cluster: &name })?;

    Ok(Json(HealthRecord::from_addon(&addon)))
}
