//! Turns a [`ConnectionDescriptor`] into a transport which can send requests
//! to the backend cluster.
//!
//! Building a transport never touches the network. Connections are opened
//! per request by [`ClusterTransport::send`], directly, through an HTTP
//! `CONNECT` proxy or through the tunnel relay.
use std::{sync::Arc, time::Duration};

use axum::body::Body;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
    header::{AUTHORIZATION, HOST, PROXY_AUTHORIZATION},
};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, pki_types::ServerName},
};
use tracing::{Instrument, debug, debug_span, instrument, warn};
use url::Url;

use crate::{
    constants::REQUEST_TIMEOUT,
    identity::Impersonation,
    resolver::{ConnectionDescriptor, Credential, DirectEndpoint, Endpoint},
    tunnel::{TunnelDialer, TunnelError},
};

pub mod tls;

pub use tls::{TlsConfigCache, TlsMaterial};

pub const IMPERSONATE_USER_HEADER: &str = "impersonate-user";
pub const IMPERSONATE_UID_HEADER: &str = "impersonate-uid";
pub const IMPERSONATE_GROUP_HEADER: &str = "impersonate-group";
pub const IMPERSONATE_EXTRA_HEADER_PREFIX: &str = "impersonate-extra-";

const HTTPS_PORT: u16 = 443;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("cluster lacks any credential"))]
    MissingCredential { cluster: String },

    #[snafu(display("cluster {cluster:?} is tunneled but no tunnel relay is configured"))]
    TunnelNotConfigured { cluster: String },

    #[snafu(display("failed to parse endpoint address {address:?}"))]
    ParseAddress {
        source: url::ParseError,
        address: String,
    },

    #[snafu(display("endpoint address {address:?} has no host"))]
    MissingHost { address: String },

    #[snafu(display("unsupported endpoint scheme {scheme:?}, only https is supported"))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("unsupported HTTP proxy scheme {scheme:?}, only http is supported"))]
    UnsupportedProxyScheme { scheme: String },

    #[snafu(display("invalid TLS server name {server_name:?}"))]
    InvalidServerName {
        source: tokio_rustls::rustls::pki_types::InvalidDnsNameError,
        server_name: String,
    },

    #[snafu(display("failed to build TLS configuration for cluster {cluster:?}"))]
    BuildTlsConfig {
        source: tls::TlsError,
        cluster: String,
    },

    #[snafu(display("invalid value for header {header:?}"))]
    InvalidHeader {
        source: http::Error,
        header: String,
    },

    #[snafu(display("failed to connect to {address:?}"))]
    Connect {
        source: std::io::Error,
        address: String,
    },

    #[snafu(display("failed to dial cluster {cluster:?} through the tunnel relay"))]
    DialTunnel { source: TunnelError, cluster: String },

    #[snafu(display("HTTP proxy {proxy} refused to connect: {status}"))]
    ProxyRefused { proxy: String, status: StatusCode },

    #[snafu(display("failed to establish HTTP proxy tunnel through {proxy}"))]
    ProxyTunnel { source: hyper::Error, proxy: String },

    #[snafu(display("TLS handshake with {server_name:?} failed"))]
    TlsHandshake {
        source: std::io::Error,
        server_name: String,
    },

    #[snafu(display("HTTP handshake with the backend failed"))]
    HttpHandshake { source: hyper::Error },

    #[snafu(display("failed to send request to the backend"))]
    SendRequest { source: hyper::Error },

    #[snafu(display("backend did not respond within {timeout:?}"))]
    Timeout { timeout: Duration },
}

impl TransportError {
    /// The descriptor cannot produce a working transport. Everything else is
    /// a connectivity failure of one request.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential { .. }
                | Self::TunnelNotConfigured { .. }
                | Self::ParseAddress { .. }
                | Self::MissingHost { .. }
                | Self::UnsupportedScheme { .. }
                | Self::UnsupportedProxyScheme { .. }
                | Self::InvalidServerName { .. }
                | Self::BuildTlsConfig { .. }
                | Self::InvalidHeader { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Byte stream a backend connection runs over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Shared factory for [`ClusterTransport`]s.
#[derive(Clone)]
pub struct TransportBuilder {
    tls_cache: Arc<TlsConfigCache>,
    tunnel: Option<Arc<dyn TunnelDialer>>,
    timeout: Duration,
}

impl TransportBuilder {
    pub fn new(tunnel: Option<Arc<dyn TunnelDialer>>) -> Self {
        Self {
            tls_cache: Arc::new(TlsConfigCache::new()),
            tunnel,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tls_cache(&self) -> &TlsConfigCache {
        &self.tls_cache
    }

    /// Builds the transport for one request. When `impersonation` is given,
    /// every request sent through the transport carries impersonation
    /// headers.
    #[instrument(
        name = "build_transport",
        skip(self, descriptor, impersonation),
        fields(cluster.name = %descriptor.cluster),
    )]
    pub async fn build(
        &self,
        descriptor: &ConnectionDescriptor,
        impersonation: Option<&Impersonation>,
    ) -> Result<ClusterTransport> {
        let cluster = &descriptor.cluster;
        let credential = descriptor
            .credential
            .as_ref()
            .context(MissingCredentialSnafu { cluster })?;

        let (base_url, target, insecure, ca_bundle) = match &descriptor.endpoint {
            Endpoint::Direct(endpoint) => {
                let base_url = parse_address(&endpoint.address)?;
                let target = direct_target(&base_url, endpoint)?;
                (
                    base_url,
                    target,
                    endpoint.insecure,
                    endpoint.ca_bundle.as_deref(),
                )
            }
            Endpoint::Tunneled => {
                let dialer = self
                    .tunnel
                    .clone()
                    .context(TunnelNotConfiguredSnafu { cluster })?;
                // The relay routes by cluster name. It is the trust boundary,
                // so the backend certificate is not verified.
                let base_url = parse_address(&format!("https://{cluster}"))?;
                let target = Target::Tunnel {
                    dialer,
                    address: format!("{cluster}:{HTTPS_PORT}"),
                };
                (base_url, target, true, None)
            }
        };

        let host = base_url
            .host_str()
            .context(MissingHostSnafu {
                address: base_url.as_str(),
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let server_name = ServerName::try_from(host.clone())
            .context(InvalidServerNameSnafu { server_name: &host })?;

        let (client_certificate, client_key) = match credential {
            Credential::X509 {
                certificate_pem,
                private_key_pem,
            } => (
                Some(certificate_pem.as_slice()),
                Some(private_key_pem.as_slice()),
            ),
            Credential::BearerToken(_) => (None, None),
        };
        let tls = self
            .tls_cache
            .get_or_build(&TlsMaterial {
                ca_bundle,
                client_certificate,
                client_key,
                server_name: &host,
                insecure,
            })
            .await
            .context(BuildTlsConfigSnafu { cluster })?;

        let headers = credential_headers(credential, impersonation)?;

        Ok(ClusterTransport {
            cluster: cluster.clone(),
            base_url,
            target,
            tls,
            server_name,
            headers,
            timeout: self.timeout,
        })
    }
}

/// Parses an endpoint address. A bare host gets the `https` scheme and the
/// default port.
fn parse_address(address: &str) -> Result<Url> {
    let with_scheme;
    let address = if address.contains("://") {
        address
    } else {
        with_scheme = format!("https://{address}");
        &with_scheme
    };

    let url = Url::parse(address).context(ParseAddressSnafu { address })?;
    ensure!(
        url.scheme() == "https",
        UnsupportedSchemeSnafu {
            scheme: url.scheme()
        }
    );
    ensure!(url.host_str().is_some(), MissingHostSnafu { address });
    Ok(url)
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    format!("{host}:{}", url.port().unwrap_or(HTTPS_PORT))
}

fn direct_target(base_url: &Url, endpoint: &DirectEndpoint) -> Result<Target> {
    let address = authority(base_url);
    let Some(proxy) = &endpoint.proxy_url else {
        return Ok(Target::Direct { address });
    };

    ensure!(
        proxy.scheme() == "http",
        UnsupportedProxySchemeSnafu {
            scheme: proxy.scheme()
        }
    );
    let proxy_host = proxy.host_str().context(MissingHostSnafu {
        address: proxy.as_str(),
    })?;
    let authorization = (!proxy.username().is_empty()).then(|| {
        let credentials = format!(
            "{}:{}",
            proxy.username(),
            proxy.password().unwrap_or_default()
        );
        format!("Basic {}", STANDARD.encode(credentials))
    });

    Ok(Target::HttpProxy {
        proxy: format!("{proxy_host}:{}", proxy.port_or_known_default().unwrap_or(80)),
        authorization,
        address,
    })
}

fn credential_headers(
    credential: &Credential,
    impersonation: Option<&Impersonation>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    if let Credential::BearerToken(token) = credential {
        let mut value = header_value(AUTHORIZATION.as_str(), &format!("Bearer {}", &**token))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    let Some(impersonation) = impersonation.filter(|i| !i.is_empty()) else {
        return Ok(headers);
    };

    headers.insert(
        HeaderName::from_static(IMPERSONATE_USER_HEADER),
        header_value(IMPERSONATE_USER_HEADER, &impersonation.username)?,
    );
    if !impersonation.uid.is_empty() {
        headers.insert(
            HeaderName::from_static(IMPERSONATE_UID_HEADER),
            header_value(IMPERSONATE_UID_HEADER, &impersonation.uid)?,
        );
    }
    for group in &impersonation.groups {
        headers.append(
            HeaderName::from_static(IMPERSONATE_GROUP_HEADER),
            header_value(IMPERSONATE_GROUP_HEADER, group)?,
        );
    }
    for (key, values) in &impersonation.extra {
        let name = format!("{IMPERSONATE_EXTRA_HEADER_PREFIX}{}", escape_extra_key(key));
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(http::Error::from)
            .context(InvalidHeaderSnafu { header: &name })?;
        for value in values {
            headers.append(header_name.clone(), header_value(&name, value)?);
        }
    }

    Ok(headers)
}

fn header_value(header: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(http::Error::from)
        .context(InvalidHeaderSnafu { header })
}

/// Extra keys may contain characters which are not allowed in header names,
/// so they are percent-encoded.
pub fn escape_extra_key(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

enum Target {
    Direct {
        address: String,
    },
    HttpProxy {
        proxy: String,
        authorization: Option<String>,
        address: String,
    },
    Tunnel {
        dialer: Arc<dyn TunnelDialer>,
        address: String,
    },
}

/// A transport bound to one cluster, its credential and optionally an
/// impersonated identity.
pub struct ClusterTransport {
    cluster: String,
    base_url: Url,
    target: Target,
    tls: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    headers: HeaderMap,
    timeout: Duration,
}

impl ClusterTransport {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn tls_config(&self) -> &Arc<ClientConfig> {
        &self.tls
    }

    /// Headers added to every request: the credential and impersonation.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Joins `path` onto the endpoint's base path.
    pub fn request_uri(&self, path: &str, query: Option<&str>) -> Result<Uri> {
        let base = self.base_url.path().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let mut uri = format!("{base}/{path}");
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }

        uri.parse::<Uri>()
            .map_err(http::Error::from)
            .context(InvalidHeaderSnafu { header: ":path" })
    }

    /// The value of the `Host` header for backend requests.
    pub fn host(&self) -> String {
        match self.base_url.port() {
            Some(port) => format!("{}:{port}", self.base_url.host_str().unwrap_or_default()),
            None => self.base_url.host_str().unwrap_or_default().to_owned(),
        }
    }

    /// Sends a request over a fresh connection. The timeout covers
    /// connecting and receiving the response head; the body is streamed
    /// afterwards without a deadline.
    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Incoming>> {
        for name in self.headers.keys() {
            request.headers_mut().remove(name);
        }
        for (name, value) in &self.headers {
            request.headers_mut().append(name, value.clone());
        }
        if let Ok(host) = HeaderValue::from_str(&self.host()) {
            request.headers_mut().insert(HOST, host);
        }

        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| TransportError::Timeout {
                timeout: self.timeout,
            })?
    }

    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Incoming>> {
        let stream = self.connect().await?;
        let server_name = format!("{:?}", self.server_name);
        let stream = TlsConnector::from(self.tls.clone())
            .connect(self.server_name.clone(), stream)
            .await
            .context(TlsHandshakeSnafu { server_name })?;

        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .context(HttpHandshakeSnafu)?;

        let span = debug_span!("backend_connection", cluster.name = %self.cluster);
        tokio::spawn(
            async move {
                if let Err(err) = connection.with_upgrades().await {
                    debug!(
                        error = &err as &dyn std::error::Error,
                        "backend connection closed with error"
                    );
                }
            }
            .instrument(span),
        );

        sender.send_request(request).await.context(SendRequestSnafu)
    }

    async fn connect(&self) -> Result<Box<dyn Io>> {
        match &self.target {
            Target::Direct { address } => {
                let stream = TcpStream::connect(address)
                    .await
                    .context(ConnectSnafu { address })?;
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        error = &err as &dyn std::error::Error,
                        peer.address = %address,
                        "failed to set TCP_NODELAY on backend connection"
                    );
                }
                Ok(Box::new(stream))
            }
            Target::HttpProxy {
                proxy,
                authorization,
                address,
            } => http_connect(proxy, authorization.as_deref(), address).await,
            Target::Tunnel { dialer, address } => {
                let stream = dialer
                    .dial(&self.cluster, address)
                    .await
                    .context(DialTunnelSnafu {
                        cluster: &self.cluster,
                    })?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Opens a tunnel to `address` through an HTTP proxy with `CONNECT`.
async fn http_connect(
    proxy: &str,
    authorization: Option<&str>,
    address: &str,
) -> Result<Box<dyn Io>> {
    let stream = TcpStream::connect(proxy)
        .await
        .context(ConnectSnafu { address: proxy })?;
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .context(ProxyTunnelSnafu { proxy })?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            warn!(
                error = &err as &dyn std::error::Error,
                "HTTP proxy connection failed"
            );
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(address)
        .header(HOST, address);
    if let Some(authorization) = authorization {
        request = request.header(PROXY_AUTHORIZATION, authorization);
    }
    let request = request
        .body(Empty::new())
        .context(InvalidHeaderSnafu {
            header: PROXY_AUTHORIZATION.as_str(),
        })?;

    let response = sender
        .send_request(request)
        .await
        .context(ProxyTunnelSnafu { proxy })?;
    ensure!(
        response.status() == StatusCode::OK,
        ProxyRefusedSnafu {
            proxy,
            status: response.status()
        }
    );

    let upgraded = hyper::upgrade::on(response)
        .await
        .context(ProxyTunnelSnafu { proxy })?;
    Ok(Box::new(TokioIo::new(upgraded)))
}
