//! A server which terminates TLS connections and hands the requests to an
//! axum [`Router`].
use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{Router, extract::Request};
use futures_util::{FutureExt as _, pin_mut, select};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use opentelemetry::trace::{FutureExt, SpanKind};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        RootCertStore, ServerConfig,
        crypto::ring::default_provider,
        server::WebPkiClientVerifier,
        version::{TLS12, TLS13},
    },
};
use tower::{Service, ServiceExt};
use tracing::{Instrument, Span, field::Empty, instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::proxy::PeerVerified;

mod cert_resolver;

pub use cert_resolver::{CertificateResolver, CertificateResolverError};

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to read request header client CA from {path:?}"))]
    ReadClientCa {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("request header client CA {path:?} contains no certificate"))]
    EmptyClientCa { path: std::path::PathBuf },

    #[snafu(display("failed to add request header client CA certificate"))]
    AddClientCaCertificate { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to build client certificate verifier"))]
    BuildClientVerifier {
        source: tokio_rustls::rustls::server::VerifierBuilderError,
    },

    #[snafu(display("failed to create {signal} signal listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// Serves the router over HTTPS. Connections presenting a client
/// certificate signed by the request header CA are marked with
/// [`PeerVerified`], which is the only way caller identity headers are
/// trusted.
pub struct GatewayServer {
    config: ServerConfig,
    verifies_clients: bool,

    socket_addr: SocketAddr,
    router: Router,
}

impl GatewayServer {
    #[instrument(name = "create_gateway_server", skip(router, cert_resolver))]
    pub fn new(
        socket_addr: SocketAddr,
        router: Router,
        cert_resolver: Arc<CertificateResolver>,
        client_ca_file: Option<&Path>,
    ) -> Result<Self> {
        let tls_provider = Arc::new(default_provider());
        let builder = ServerConfig::builder_with_provider(tls_provider.clone())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?;

        let builder = match client_ca_file {
            Some(path) => {
                let roots = load_client_ca(path)?;
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), tls_provider)
                        .allow_unauthenticated()
                        .build()
                        .context(BuildClientVerifierSnafu)?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(cert_resolver);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            config,
            verifies_clients: client_ca_file.is_some(),
            socket_addr,
            router,
        })
    }

    /// Runs the server by listening for incoming TCP connections on the
    /// bound socket address. It only accepts TLS connections.
    pub async fn run(self) -> Result<()> {
        let tcp_listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;
        self.serve(tcp_listener).await;
        Ok(())
    }

    /// Accepts connections on an already bound listener until the future is
    /// dropped.
    pub async fn serve(self, tcp_listener: TcpListener) {
        let tls_acceptor = TlsAcceptor::from(Arc::new(self.config));
        let verifies_clients = self.verifies_clients;
        let network_type = self.socket_addr.semantic_convention_network_type();

        let mut router = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        loop {
            let tls_acceptor = tls_acceptor.clone();

            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok((stream, addr)) => (stream, addr),
                Err(err) => {
                    tracing::trace!(%err, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            // Extracts the connect info, the error type is infallible
            let Ok(tower_service) = router.call(remote_addr).await;

            let span = tracing::debug_span!("accept tcp connection");
            tokio::spawn(
                async move {
                    let span = tracing::trace_span!(
                        "accept tls connection",
                        "otel.kind" = ?SpanKind::Server,
                        "otel.status_code" = Empty,
                        "otel.status_message" = Empty,
                        "client.address" = remote_addr.ip().to_string(),
                        "client.port" = i64::from(remote_addr.port()),
                        "client.verified" = Empty,
                        "server.address" = Empty,
                        "server.port" = Empty,
                        "network.peer.address" = remote_addr.ip().to_string(),
                        "network.peer.port" = i64::from(remote_addr.port()),
                        "network.transport" = "tcp",
                        "network.type" = network_type,
                    );

                    if let Ok(local_addr) = tcp_stream.local_addr() {
                        span.record("server.address", local_addr.ip().to_string())
                            .record("server.port", i64::from(local_addr.port()));
                    }

                    let tls_stream = match tls_acceptor
                        .accept(tcp_stream)
                        .instrument(span.clone())
                        .await
                    {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            span.record("otel.status_code", "Error")
                                .record("otel.status_message", err.to_string());
                            tracing::trace!(%remote_addr, "error during tls handshake connection");
                            return;
                        }
                    };

                    // The verifier rejects any certificate not signed by the
                    // client CA, so a present certificate is a verified one.
                    let peer = PeerVerified(
                        verifies_clients && tls_stream.get_ref().1.peer_certificates().is_some(),
                    );
                    span.record("client.verified", peer.0);

                    let tls_stream = TokioIo::new(tls_stream);
                    let hyper_service = service_fn(move |mut request: Request<Incoming>| {
                        request.extensions_mut().insert(peer);
                        // Carries the trace id so that the TraceLayer can use it as parent
                        let otel_context = Span::current().context();
                        tower_service
                            .clone()
                            .oneshot(request)
                            .with_context(otel_context)
                    });

                    let span = tracing::debug_span!("serve connection");
                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(tls_stream, hyper_service)
                        .instrument(span.clone())
                        .await
                        .unwrap_or_else(|err| {
                            span.record("otel.status_code", "Error")
                                .record("otel.status_message", err.to_string());
                            tracing::warn!(%err, %remote_addr, "failed to serve connection");
                        });
                }
                .instrument(span),
            );
        }
    }
}

fn load_client_ca(path: &Path) -> Result<RootCertStore> {
    let pem = std::fs::read(path).context(ReadClientCaSnafu { path })?;
    let certificates = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context(ReadClientCaSnafu { path })?;
    snafu::ensure!(!certificates.is_empty(), EmptyClientCaSnafu { path });

    let mut roots = RootCertStore::empty();
    for certificate in certificates {
        roots
            .add(certificate)
            .context(AddClientCaCertificateSnafu)?;
    }
    Ok(roots)
}

/// Resolves once SIGINT or SIGTERM was received.
pub async fn shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context(CreateSignalListenerSnafu {
        signal: "SIGINT",
    })?;
    let mut sigterm = signal(SignalKind::terminate()).context(CreateSignalListenerSnafu {
        signal: "SIGTERM",
    })?;
    tracing::debug!("created unix signal handlers");

    let sigint = sigint.recv().fuse();
    let sigterm = sigterm.recv().fuse();
    pin_mut!(sigint, sigterm);
    select! {
        _ = sigint => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm => tracing::info!("received SIGTERM, shutting down"),
    }
    Ok(())
}

pub trait SocketAddrExt {
    fn semantic_convention_network_type(&self) -> &'static str;
}

impl SocketAddrExt for SocketAddr {
    fn semantic_convention_network_type(&self) -> &'static str {
        match self {
            SocketAddr::V4(_) => "ipv4",
            SocketAddr::V6(_) => "ipv6",
        }
    }
}
