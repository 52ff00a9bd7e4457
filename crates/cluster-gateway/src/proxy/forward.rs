//! The request pipeline: authorize, resolve, exchange the identity, forward
//! and record the outcome.
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};

use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use http::{
    HeaderMap, HeaderName, StatusCode, Version,
    header::{self, HeaderValue},
};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tracing::{Instrument, debug, debug_span, info, instrument};

use super::{
    ProxyState,
    authn::{self, PeerVerified},
    authz::{Decision, RequestAttributes},
    error::{
        AuthorizeSnafu, BuildTransportSnafu, ForbiddenSnafu, InvalidRequestSnafu,
        ProxyError, ResolveSnafu,
    },
    escape::unescape_query,
    metrics::{CLIENT_CLOSED_REQUEST, ProxyMetrics, RequestRecord},
};
use crate::{
    constants::{GATEWAY_API_GROUP, GATEWAY_API_VERSION, GATEWAY_RESOURCE},
    identity::Identity,
    transport::{IMPERSONATE_EXTRA_HEADER_PREFIX, IMPERSONATE_GROUP_HEADER, IMPERSONATE_UID_HEADER,
        IMPERSONATE_USER_HEADER},
};

/// Query option asking for the caller's identity to be exchanged.
pub const IMPERSONATE_OPTION: &str = "impersonate";

/// Headers that only apply to a single connection.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything after `/proxy` in a proxy request path, or [`None`] if
/// `request_path` is not a proxy request.
///
/// The cluster segment is skipped as it was sent, as it may be
/// percent-encoded while the routed cluster name is decoded.
pub fn backend_path(request_path: &str) -> Option<&str> {
    let resources = format!("/apis/{GATEWAY_API_GROUP}/{GATEWAY_API_VERSION}/{GATEWAY_RESOURCE}/");
    let (_cluster, rest) = request_path
        .strip_prefix(&resources)?
        .split_once('/')
        .filter(|(cluster, _)| !cluster.is_empty())?;
    match rest.strip_prefix("proxy")? {
        "" => Some("/"),
        path if path.starts_with('/') => Some(path),
        _ => None,
    }
}

/// Records the outcome of a request exactly once. A request which is dropped
/// before an outcome was recorded was abandoned by the caller.
pub struct Finalizer {
    metrics: Arc<dyn ProxyMetrics>,
    labels: Option<(String, String, String)>,
    start: Instant,
}

impl Finalizer {
    pub fn new(
        metrics: Arc<dyn ProxyMetrics>,
        attributes: &RequestAttributes,
        cluster: &str,
        start: Instant,
    ) -> Self {
        Self {
            metrics,
            labels: Some((
                attributes.resource().to_owned(),
                attributes.verb().to_owned(),
                cluster.to_owned(),
            )),
            start,
        }
    }

    pub fn finish(mut self, code: u16) {
        self.record(code);
    }

    fn record(&mut self, code: u16) {
        if let Some((resource, verb, cluster)) = self.labels.take() {
            self.metrics.record_request(RequestRecord {
                resource,
                verb,
                cluster,
                code,
                latency: self.start.elapsed(),
            });
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.record(CLIENT_CLOSED_REQUEST);
    }
}

/// Response body which records the outcome once the backend body has been
/// fully relayed.
#[pin_project]
struct ObservedBody<B> {
    #[pin]
    inner: B,
    finalizer: Option<Finalizer>,
    code: u16,
}

impl<B> ObservedBody<B>
where
    B: HttpBody,
{
    fn new(inner: B, finalizer: Finalizer, code: u16) -> Self {
        let mut body = Self {
            inner,
            finalizer: Some(finalizer),
            code,
        };
        // Empty bodies are never polled.
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    fn finish(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finish(self.code);
        }
    }
}

impl<B> HttpBody for ObservedBody<B>
where
    B: HttpBody,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));

        let finished = match &frame {
            None | Some(Err(_)) => true,
            Some(Ok(_)) => this.inner.is_end_stream(),
        };
        if finished {
            if let Some(finalizer) = this.finalizer.take() {
                finalizer.finish(*this.code);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Splits the inbound query into the query forwarded to the backend and the
/// impersonation option.
pub fn forwarded_query(query: Option<&str>) -> (Option<String>, bool) {
    let Some(query) = query.filter(|query| !query.is_empty()) else {
        return (None, false);
    };

    let mut impersonate = false;
    let forwarded: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == IMPERSONATE_OPTION {
                impersonate = value == "true";
                false
            } else {
                true
            }
        })
        .collect();

    let forwarded = unescape_query(&forwarded.join("&"));
    ((!forwarded.is_empty()).then_some(forwarded), impersonate)
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        && headers.contains_key(header::UPGRADE)
}

/// Removes headers which must not reach the backend: connection-scoped
/// headers (unless the connection is upgraded), and any credential or
/// identity assertion of the caller.
fn sanitize_request_headers(headers: &mut HeaderMap, upgrade: bool) {
    if !upgrade {
        remove_hop_by_hop_headers(headers);
    }

    let caller_assertions: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == header::AUTHORIZATION.as_str()
                || name == IMPERSONATE_USER_HEADER
                || name == IMPERSONATE_UID_HEADER
                || name == IMPERSONATE_GROUP_HEADER
                || name.starts_with(IMPERSONATE_EXTRA_HEADER_PREFIX)
                || name.starts_with("x-remote-")
        })
        .cloned()
        .collect();
    for name in caller_assertions {
        headers.remove(name);
    }
    headers.remove(header::HOST);
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Entry point for both proxy routes.
#[instrument(
    name = "proxy_request",
    skip(state, request),
    fields(
        http.request.method = %request.method(),
        http.response.status_code = tracing::field::Empty,
    ),
)]
pub async fn handle(state: ProxyState, cluster: String, request: Request) -> Response {
    let start = Instant::now();

    let Some(backend_path) = backend_path(request.uri().path()).map(ToOwned::to_owned) else {
        let response = ProxyError::InvalidProxyPath {
            path: request.uri().path().to_owned(),
        }
        .into_response();
        tracing::Span::current().record("http.response.status_code", response.status().as_u16());
        return response;
    };
    let (query, impersonate) = forwarded_query(request.uri().query());
    let attributes = RequestAttributes::parse(request.method(), &backend_path, query.as_deref());
    let finalizer = Finalizer::new(state.metrics.clone(), &attributes, &cluster, start);

    let forwarded = Forwarder {
        state: &state,
        cluster: &cluster,
        backend_path: &backend_path,
        query: query.as_deref(),
        impersonate,
        attributes: &attributes,
    }
    .forward(request, finalizer)
    .await;

    let response = match forwarded {
        Ok(response) => response,
        Err((error, finalizer)) => {
            let response = error.into_response();
            finalizer.finish(response.status().as_u16());
            response
        }
    };
    tracing::Span::current().record("http.response.status_code", response.status().as_u16());
    response
}

struct Forwarder<'a> {
    state: &'a ProxyState,
    cluster: &'a str,
    backend_path: &'a str,
    query: Option<&'a str>,
    impersonate: bool,
    attributes: &'a RequestAttributes,
}

impl Forwarder<'_> {
    async fn forward(
        &self,
        request: Request,
        finalizer: Finalizer,
    ) -> Result<Response, (ProxyError, Finalizer)> {
        let mut request = request;
        let peer = request
            .extensions()
            .get::<PeerVerified>()
            .copied()
            .unwrap_or_default();
        let identity = authn::identity_from_headers(request.headers(), peer);

        if let Err(error) = self.authorize(&identity).await {
            return Err((error, finalizer));
        }

        let upgrade = is_upgrade_request(request.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let backend_request = match self.prepare(request, &identity, upgrade).await {
            Ok(prepared) => prepared,
            Err(error) => return Err((error, finalizer)),
        };
        let (transport, backend_request) = backend_request;

        let mut response = match transport.send(backend_request).await {
            Ok(response) => response,
            Err(source) => {
                return Err((
                    ProxyError::Forward {
                        source,
                        cluster: self.cluster.to_owned(),
                    },
                    finalizer,
                ));
            }
        };

        let status = response.status();
        if let (StatusCode::SWITCHING_PROTOCOLS, Some(client_upgrade)) = (status, client_upgrade) {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            let (parts, _) = response.into_parts();
            let span = debug_span!("upgraded_connection", cluster.name = self.cluster);
            tokio::spawn(
                relay_upgraded(client_upgrade, backend_upgrade, finalizer).instrument(span),
            );
            return Ok(Response::from_parts(parts, Body::empty()));
        }

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);
        let body = ObservedBody::new(body, finalizer, status.as_u16());
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    async fn authorize(&self, identity: &Identity) -> Result<(), ProxyError> {
        let Some(authorizer) = &self.state.authorizer else {
            return Ok(());
        };

        let decision = authorizer
            .authorize(identity, self.attributes)
            .await
            .context(AuthorizeSnafu)?;
        match decision {
            Decision::Allow => Ok(()),
            Decision::Deny { reason } => ForbiddenSnafu {
                user: &identity.username,
                reason,
            }
            .fail(),
        }
    }

    /// Resolves the cluster, exchanges the identity and rewrites the request
    /// for the backend.
    async fn prepare(
        &self,
        request: Request,
        identity: &Identity,
        upgrade: bool,
    ) -> Result<(crate::transport::ClusterTransport, Request), ProxyError> {
        let cluster = self.cluster;
        let resolved = self
            .state
            .resolver
            .resolve_cluster(cluster)
            .await
            .context(ResolveSnafu { cluster })?;

        let impersonation = if self.impersonate || self.state.impersonate_by_default {
            let exchange = self
                .state
                .exchanger
                .exchange(identity, cluster, &resolved.exchange_rules)
                .await;
            exchange.impersonation().cloned()
        } else {
            None
        };

        let transport = self
            .state
            .transports
            .build(&resolved.descriptor, impersonation.as_ref())
            .await
            .context(BuildTransportSnafu { cluster })?;

        let uri = transport
            .request_uri(self.backend_path, self.query)
            .context(BuildTransportSnafu { cluster })?;

        let (mut parts, body) = request.into_parts();
        sanitize_request_headers(&mut parts.headers, upgrade);

        let mut backend_request = http::Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .context(InvalidRequestSnafu)?;
        *backend_request.headers_mut() = parts.headers;
        if upgrade {
            ensure_upgrade_headers(backend_request.headers_mut());
        }

        debug!(
            backend.path = self.backend_path,
            impersonated = impersonation.is_some(),
            "forwarding request"
        );
        Ok((transport, backend_request))
    }
}

fn ensure_upgrade_headers(headers: &mut HeaderMap) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
}

/// Relays bytes between both sides of an upgraded connection. When either
/// side finishes, both connections are closed.
async fn relay_upgraded(client: OnUpgrade, backend: OnUpgrade, finalizer: Finalizer) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(err) => {
            debug!(
                error = &err as &dyn std::error::Error,
                "connection upgrade failed"
            );
            finalizer.finish(CLIENT_CLOSED_REQUEST);
            return;
        }
    };

    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(client));
    let (mut backend_read, mut backend_write) = tokio::io::split(TokioIo::new(backend));

    let code = tokio::select! {
        _ = tokio::io::copy(&mut client_read, &mut backend_write) => {
            info!("client closed upgraded connection");
            CLIENT_CLOSED_REQUEST
        }
        _ = tokio::io::copy(&mut backend_read, &mut client_write) => {
            debug!("backend closed upgraded connection");
            StatusCode::SWITCHING_PROTOCOLS.as_u16()
        }
    };

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;
    finalizer.finish(code);
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt, Full};
    use rstest::rstest;

    use super::*;
    use crate::proxy::metrics::InMemoryMetrics;

    #[rstest]
    #[case(None, None, false)]
    #[case(Some("impersonate=true"), None, true)]
    #[case(Some("impersonate=false&watch=1"), Some("watch=1"), false)]
    #[case(Some("__dryRun=All&impersonate=true"), Some("dryRun=All"), true)]
    #[case(Some("labelSelector=a%3Db"), Some("labelSelector=a%3Db"), false)]
    fn splits_forwarded_query(
        #[case] query: Option<&str>,
        #[case] forwarded: Option<&str>,
        #[case] impersonate: bool,
    ) {
        assert_eq!(
            forwarded_query(query),
            (forwarded.map(ToOwned::to_owned), impersonate)
        );
    }

    #[rstest]
    #[case::root("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxy", Some("/"))]
    #[case::trailing_slash("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxy/", Some("/"))]
    #[case::pod(
        "/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxy/api/v1/namespaces/default/pods/x",
        Some("/api/v1/namespaces/default/pods/x")
    )]
    #[case::encoded_cluster(
        "/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c%31/proxy/api/v1/namespaces/default/pods/x",
        Some("/api/v1/namespaces/default/pods/x")
    )]
    #[case::not_proxy("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/proxyx", None)]
    #[case::health("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/c1/health", None)]
    #[case::empty_cluster("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways//proxy", None)]
    #[case::other("/healthz", None)]
    fn extracts_backend_path(#[case] request_path: &str, #[case] expected: Option<&str>) {
        assert_eq!(backend_path(request_path), expected);
    }

    #[rstest]
    #[case(&[("connection", "Upgrade"), ("upgrade", "SPDY/3.1")], true)]
    #[case(&[("connection", "keep-alive, upgrade"), ("upgrade", "websocket")], true)]
    #[case(&[("connection", "keep-alive")], false)]
    #[case(&[("upgrade", "websocket")], false)]
    fn detects_upgrades(#[case] headers: &[(&'static str, &'static str)], #[case] expected: bool) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        assert_eq!(is_upgrade_request(&map), expected);
    }

    #[test]
    fn caller_credentials_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        headers.insert("impersonate-user", HeaderValue::from_static("root"));
        headers.insert("impersonate-extra-scopes", HeaderValue::from_static("x"));
        headers.insert("x-remote-user", HeaderValue::from_static("alice"));
        headers.insert("connection", HeaderValue::from_static("x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        sanitize_request_headers(&mut headers, false);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "application/json");
    }

    #[test]
    fn upgrade_keeps_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("SPDY/3.1"));

        sanitize_request_headers(&mut headers, true);
        assert!(is_upgrade_request(&headers));
    }

    fn finalizer(metrics: &InMemoryMetrics) -> Finalizer {
        Finalizer::new(
            Arc::new(metrics.clone()),
            &RequestAttributes::parse(&http::Method::GET, "/api/v1/pods", None),
            "c1",
            Instant::now(),
        )
    }

    #[test]
    fn dropped_finalizer_records_client_cancel() {
        let metrics = InMemoryMetrics::new();
        drop(finalizer(&metrics));

        let records = metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, CLIENT_CLOSED_REQUEST);
        assert_eq!(records[0].resource, "pods");
        assert_eq!(records[0].verb, "list");
    }

    #[test]
    fn finalizer_records_once() {
        let metrics = InMemoryMetrics::new();
        finalizer(&metrics).finish(200);

        assert_eq!(metrics.records().len(), 1);
        assert_eq!(metrics.records()[0].code, 200);
    }

    #[tokio::test]
    async fn observed_body_records_after_last_frame() {
        let metrics = InMemoryMetrics::new();
        let body = ObservedBody::new(Full::new(bytes::Bytes::from_static(b"ok")), finalizer(&metrics), 200);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, "ok");
        assert_eq!(metrics.records()[0].code, 200);
    }

    #[tokio::test]
    async fn observed_body_dropped_midway_records_cancel() {
        let metrics = InMemoryMetrics::new();
        let (sender, receiver) = tokio::sync::mpsc::channel::<Result<Frame<bytes::Bytes>, std::convert::Infallible>>(1);
        let body = ObservedBody::new(
            http_body_util::StreamBody::new(tokio_stream::wrappers::ReceiverStream::new(receiver)),
            finalizer(&metrics),
            200,
        );

        drop(body);
        drop(sender);
        assert_eq!(metrics.records()[0].code, CLIENT_CLOSED_REQUEST);
    }
}
