//! Drives the router and the health prober against an in-process backend
//! cluster served over TLS.
use std::{
    collections::BTreeMap,
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::body::Body;
use bytes::Bytes;
use cluster_gateway::{
    constants::{ADDON_NAME, DEFAULT_CLUSTER_AUTH_NAMESPACE, LABEL_KEY_CLUSTER_CREDENTIAL_TYPE},
    health::{HealthProber, HealthRecord},
    identity::IdentityExchanger,
    proxy::{self, InMemoryMetrics, PeerVerified, ProxyState},
    resolver::Resolver,
    store::{AddonRecord, ClientConfig, ClusterRecord, MemoryStore, RecordStore, SecretRecord},
    transport::TransportBuilder,
};
use gateway_certs::{CertificatePair, ca::CertificateAuthority, keys::ecdsa};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use kube::runtime::controller::Action;
use rstest::rstest;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{ServerConfig, crypto::ring::default_provider},
};
use tower::ServiceExt;

const BACKEND_TOKEN: &str = "backend-token";

#[derive(Clone, Debug)]
struct ObservedRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

struct Backend {
    address: SocketAddr,
    ca_pem: String,
    requests: Arc<Mutex<Vec<ObservedRequest>>>,
    connections: Arc<AtomicUsize>,
    closed_upgrades: Arc<AtomicUsize>,
}

impl Backend {
    /// Serves `healthz` on `/healthz` and `hello` everywhere else. Upgrade
    /// requests are switched to an echo stream.
    async fn start(healthz: (StatusCode, &'static str)) -> Self {
        let ca = CertificateAuthority::<ecdsa::SigningKey>::builder()
            .build()
            .unwrap();
        let certificate = CertificatePair::builder()
            .subject("CN=backend")
            .subject_alternative_ip_addresses(&[IpAddr::V4(Ipv4Addr::LOCALHOST)])
            .signed_by(&ca)
            .build()
            .unwrap();
        let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![certificate.certificate_der().unwrap()],
                certificate.private_key_der().unwrap(),
            )
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let closed_upgrades = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let requests = requests.clone();
            let connections = connections.clone();
            let closed_upgrades = closed_upgrades.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    let requests = requests.clone();
                    let closed_upgrades = closed_upgrades.clone();
                    tokio::spawn(async move {
                        let Ok(stream) = acceptor.accept(stream).await else {
                            return;
                        };
                        let service = service_fn(move |mut request: Request<Incoming>| {
                            requests.lock().unwrap().push(ObservedRequest {
                                method: request.method().clone(),
                                uri: request.uri().clone(),
                                headers: request.headers().clone(),
                            });
                            if let Some(protocol) = request.headers().get("upgrade").cloned() {
                                let upgrade = hyper::upgrade::on(&mut request);
                                tokio::spawn(echo(upgrade, closed_upgrades.clone()));
                                let response = Response::builder()
                                    .status(StatusCode::SWITCHING_PROTOCOLS)
                                    .header("connection", "Upgrade")
                                    .header("upgrade", protocol)
                                    .body(Full::new(Bytes::new()))
                                    .unwrap();
                                return std::future::ready(Ok::<_, Infallible>(response));
                            }
                            let (status, body) = if request.uri().path() == "/healthz" {
                                healthz
                            } else {
                                (StatusCode::OK, "hello")
                            };
                            let response = Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap();
                            std::future::ready(Ok::<_, Infallible>(response))
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
            }
        });

        Self {
            address,
            ca_pem: ca.ca_cert_pem().unwrap(),
            requests,
            connections,
            closed_upgrades,
        }
    }

    fn requests(&self) -> Vec<ObservedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Echoes the upgraded stream until the gateway closes it.
async fn echo(upgrade: hyper::upgrade::OnUpgrade, closed: Arc<AtomicUsize>) {
    let Ok(upgraded) = upgrade.await else {
        return;
    };
    let mut stream = TokioIo::new(upgraded);
    let mut buffer = [0; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                if stream.write_all(&buffer[..read]).await.is_err() {
                    break;
                }
            }
        }
    }
    closed.fetch_add(1, Ordering::SeqCst);
}

struct Gateway {
    store: Arc<MemoryStore>,
    metrics: InMemoryMetrics,
    resolver: Arc<Resolver>,
    transports: Arc<TransportBuilder>,
}

impl Gateway {
    /// Registers cluster `c1` pointing at the backend. `token` is stored as
    /// the cluster's bearer token, an empty token leaves the credential
    /// without material.
    async fn new(backend: &Backend, token: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_cluster(ClusterRecord {
                name: "c1".to_owned(),
                client_configs: vec![ClientConfig {
                    url: format!("https://{}", backend.address),
                    ca_bundle: Some(backend.ca_pem.clone().into_bytes()),
                }],
            })
            .await;
        store
            .insert_addon(AddonRecord {
                cluster: "c1".to_owned(),
                name: ADDON_NAME.to_owned(),
                ..Default::default()
            })
            .await;
        store
            .insert_secret(SecretRecord {
                namespace: "c1".to_owned(),
                name: ADDON_NAME.to_owned(),
                labels: BTreeMap::from([(
                    LABEL_KEY_CLUSTER_CREDENTIAL_TYPE.to_owned(),
                    "ServiceAccountToken".to_owned(),
                )]),
                data: BTreeMap::from([("token".to_owned(), token.as_bytes().to_vec())]),
                ..Default::default()
            })
            .await;

        Self {
            resolver: Arc::new(Resolver::new(store.clone(), false)),
            transports: Arc::new(TransportBuilder::new(None)),
            metrics: InMemoryMetrics::new(),
            store,
        }
    }

    fn router(&self) -> axum::Router {
        proxy::router(ProxyState {
            store: self.store.clone(),
            resolver: self.resolver.clone(),
            transports: self.transports.clone(),
            exchanger: Arc::new(IdentityExchanger::new(
                self.store.clone(),
                Vec::new(),
                DEFAULT_CLUSTER_AUTH_NAMESPACE,
            )),
            authorizer: None,
            metrics: Arc::new(self.metrics.clone()),
            impersonate_by_default: false,
        })
    }

    /// Serves the router on a local port, which connection upgrades need.
    async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let router = self.router();
        tokio::spawn(async move { axum::serve(listener, router).await });
        address
    }

    fn prober(&self) -> HealthProber {
        HealthProber::new(
            self.store.clone(),
            self.resolver.clone(),
            self.transports.clone(),
        )
    }
}

fn gateway_uri(cluster: &str, rest: &str) -> String {
    format!("/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/{cluster}/{rest}")
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn forwards_with_cluster_credential() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    let request = Request::get(gateway_uri(
        "c1",
        "proxy/api/v1/namespaces/default/pods?limit=1",
    ))
    .header("authorization", "Bearer caller-token")
    .header("x-remote-user", "mallory")
    .body(Body::empty())
    .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "hello");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    let observed = &requests[0];
    assert_eq!(observed.method, Method::GET);
    assert_eq!(observed.uri.path(), "/api/v1/namespaces/default/pods");
    assert_eq!(observed.uri.query(), Some("limit=1"));
    assert_eq!(
        observed.headers["authorization"],
        format!("Bearer {BACKEND_TOKEN}").as_str()
    );
    assert!(!observed.headers.contains_key("x-remote-user"));
    assert!(!observed.headers.contains_key("impersonate-user"));

    let records = gateway.metrics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cluster, "c1");
    assert_eq!(records[0].code, 200);
}

#[tokio::test]
async fn encoded_cluster_name_keeps_backend_path() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    let request = Request::delete(gateway_uri(
        "c%31",
        "proxy/api/v1/namespaces/default/pods/x",
    ))
    .body(Body::empty())
    .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::DELETE);
    assert_eq!(requests[0].uri.path(), "/api/v1/namespaces/default/pods/x");
}

#[tokio::test]
async fn impersonates_verified_caller() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    let mut request = Request::get(gateway_uri(
        "c1",
        "proxy/api/v1/namespaces?impersonate=true&labelSelector=a%3Db",
    ))
    .header("x-remote-user", "alice")
    .header("x-remote-group", "developers")
    .body(Body::empty())
    .unwrap();
    request.extensions_mut().insert(PeerVerified(true));
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = backend.requests();
    let observed = &requests[0];
    assert_eq!(observed.headers["impersonate-user"], "alice");
    assert_eq!(observed.headers["impersonate-group"], "developers");
    let query = observed.uri.query().unwrap_or_default();
    assert!(!query.contains("impersonate"));
    assert!(query.contains("labelSelector"));
}

#[tokio::test]
async fn missing_credential_never_reaches_backend() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, "").await;

    let request = Request::get(gateway_uri("c1", "proxy/api"))
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(backend.connections.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.metrics.records()[0].code, 502);
}

#[tokio::test]
async fn unknown_cluster_is_not_found() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    let request = Request::get(gateway_uri("c9", "proxy/api"))
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(backend.requests().is_empty());
}

#[rstest]
#[case::healthy((StatusCode::OK, "ok"), HealthRecord::healthy(), Action::await_change())]
#[case::failing(
    (StatusCode::INTERNAL_SERVER_ERROR, "fail"),
    HealthRecord::unhealthy("fail"),
    Action::requeue(Duration::from_secs(5))
)]
#[tokio::test]
async fn health_is_probed_and_served(
    #[case] healthz: (StatusCode, &'static str),
    #[case] expected: HealthRecord,
    #[case] action: Action,
) {
    let backend = Backend::start(healthz).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    assert_eq!(gateway.prober().reconcile("c1").await.unwrap(), action);

    let addon = gateway.store.get_addon("c1", ADDON_NAME).await.unwrap();
    assert_eq!(HealthRecord::recorded(&addon), Some(expected.clone()));
    let condition = addon.condition("Available").unwrap();
    assert_eq!(condition.status, expected.healthy);

    let request = Request::get(gateway_uri("c1", "health"))
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let served: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(
        served,
        serde_json::json!({ "healthy": expected.healthy, "reason": expected.reason })
    );

    let probe = &backend.requests()[0];
    assert_eq!(probe.uri.path(), "/healthz");
    assert_eq!(
        probe.headers["authorization"],
        format!("Bearer {BACKEND_TOKEN}").as_str()
    );
}

#[tokio::test]
async fn unchanged_health_is_not_rewritten() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;
    let prober = gateway.prober();

    prober.reconcile("c1").await.unwrap();
    let writes = gateway.store.write_count();
    prober.reconcile("c1").await.unwrap();

    assert_eq!(gateway.store.write_count(), writes);
}

#[tokio::test]
async fn health_of_unknown_cluster_is_not_found() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;

    let request = Request::get(gateway_uri("c9", "health"))
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Polls `condition` until it holds or five seconds passed.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn upgraded_connection_closes_with_client() {
    let backend = Backend::start((StatusCode::OK, "ok")).await;
    let gateway = Gateway::new(&backend, BACKEND_TOKEN).await;
    let address = gateway.serve().await;

    let mut client = TcpStream::connect(address).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nhost: gateway\r\nconnection: Upgrade\r\nupgrade: SPDY/3.1\r\n\r\n",
        gateway_uri("c1", "proxy/api/v1/namespaces/default/pods/x/exec")
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0; 1];
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    drop(client);

    assert!(eventually(|| backend.closed_upgrades.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| !gateway.metrics.records().is_empty()).await);
    let records = gateway.metrics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code, 499);
    assert_eq!(records[0].verb, "get");
}
