//! Egress to clusters without a direct network path, through a gRPC relay.
//!
//! Every dial opens its own relay session: a fresh TLS connection to the
//! relay, authenticated with the gateway's operator identity, carrying one
//! `ProxyService.Proxy` stream. The session is exposed as one half of an
//! in-memory duplex pipe. Dropping that half ends the session and closes the
//! relay connection.
use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use http::uri::PathAndQuery;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Streaming,
    client::Grpc,
    codec::ProstCodec,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity},
};
use tracing::{Instrument, debug, info_span, instrument, trace, warn};

use crate::constants::TUNNEL_KEEPALIVE_INTERVAL;

pub mod proto;

use proto::{PROXY_METHOD_PATH, Packet, packet::Payload};

/// Capacity of the in-memory pipe between the HTTP client and the relay
/// session.
const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 16 * 1024;
const OUTBOUND_QUEUE: usize = 16;

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TunnelError {
    #[snafu(display("failed to read relay TLS material from {path:?}"))]
    ReadTlsMaterial {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("invalid relay address {address:?}"))]
    InvalidRelayAddress {
        source: tonic::transport::Error,
        address: String,
    },

    #[snafu(display("failed to connect to relay {address:?}"))]
    ConnectRelay {
        source: tonic::transport::Error,
        address: String,
    },

    #[snafu(display("failed to open proxy stream on relay"))]
    OpenStream { source: tonic::Status },

    #[snafu(display("relay closed the stream before answering the dial request"))]
    StreamClosed,

    #[snafu(display("relay failed to dial {address:?}: {message}"))]
    DialRejected { address: String, message: String },

    #[snafu(display("dial response does not match the request"))]
    UnexpectedDialResponse,
}

/// The relay connection material. Files are read on every dial so rotated
/// certificates are picked up.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Opens connections to cluster addresses.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// `address` is `host:port` as seen from the relay.
    async fn dial(&self, cluster: &str, address: &str) -> Result<DuplexStream>;
}

#[derive(Clone, Debug)]
pub struct GrpcTunnelDialer {
    config: RelayConfig,
    keepalive_interval: Duration,
}

impl GrpcTunnelDialer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            keepalive_interval: TUNNEL_KEEPALIVE_INTERVAL,
        }
    }

    async fn read(path: &PathBuf) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .context(ReadTlsMaterialSnafu { path })
    }

    async fn connect(&self) -> Result<Channel> {
        let address = format!("https://{}:{}", self.config.host, self.config.port);
        let ca = Self::read(&self.config.ca_cert_file).await?;
        let cert = Self::read(&self.config.cert_file).await?;
        let key = Self::read(&self.config.key_file).await?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key))
            .domain_name(self.config.host.clone());

        Endpoint::from_shared(address.clone())
            .context(InvalidRelayAddressSnafu {
                address: address.clone(),
            })?
            .tls_config(tls)
            .context(InvalidRelayAddressSnafu {
                address: address.clone(),
            })?
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_while_idle(true)
            .connect()
            .await
            .context(ConnectRelaySnafu { address })
    }
}

#[async_trait]
impl TunnelDialer for GrpcTunnelDialer {
    #[instrument(name = "dial_tunnel", skip(self), fields(relay.host = %self.config.host))]
    async fn dial(&self, cluster: &str, address: &str) -> Result<DuplexStream> {
        let channel = self.connect().await?;
        let mut client = Grpc::new(channel);
        client.ready().await.context(ConnectRelaySnafu {
            address: self.config.host.clone(),
        })?;

        let random = rand::random::<i64>();
        let (outbound, outbound_stream) = open_outbound(address, random);

        let codec: ProstCodec<Packet, Packet> = ProstCodec::default();
        let mut inbound = client
            .streaming(
                tonic::Request::new(outbound_stream),
                PathAndQuery::from_static(PROXY_METHOD_PATH),
                codec,
            )
            .await
            .context(OpenStreamSnafu)?
            .into_inner();

        let connect_id = await_dial_response(&mut inbound, address, random).await?;
        debug!(connect_id, "relay session established");

        let (connection, local) = tokio::io::duplex(PIPE_CAPACITY);
        let span = info_span!("tunnel_session", cluster.name = cluster, connect_id);
        tokio::spawn(
            async move {
                // The client owns the relay connection; it lives as long as
                // the session.
                let _client = client;
                relay(local, connect_id, outbound, inbound).await;
            }
            .instrument(span),
        );

        Ok(connection)
    }
}

/// The outbound half of a relay stream, opening with the dial request. The
/// stream ends once every sender is dropped.
fn open_outbound(address: &str, random: i64) -> (mpsc::Sender<Packet>, ReceiverStream<Packet>) {
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    // The channel is empty and its receiver alive, so this cannot fail.
    let _ = outbound.try_send(Packet::dial_request(address, random));
    (outbound, ReceiverStream::new(outbound_rx))
}

async fn await_dial_response(
    inbound: &mut Streaming<Packet>,
    address: &str,
    random: i64,
) -> Result<i64> {
    loop {
        let packet = inbound
            .message()
            .await
            .context(OpenStreamSnafu)?
            .context(StreamClosedSnafu)?;

        match packet.payload {
            Some(Payload::DialResponse(response)) => {
                ensure!(response.random == random, UnexpectedDialResponseSnafu);
                ensure!(
                    response.error.is_empty(),
                    DialRejectedSnafu {
                        address,
                        message: response.error,
                    }
                );
                return Ok(response.connect_id);
            }
            Some(Payload::CloseDial(close)) if close.random == random => {
                return StreamClosedSnafu.fail();
            }
            _ => trace!("ignoring packet while waiting for dial response"),
        }
    }
}

/// Pumps bytes between the local pipe and the relay stream until either side
/// closes.
async fn relay(
    local: DuplexStream,
    connect_id: i64,
    outbound: mpsc::Sender<Packet>,
    mut inbound: Streaming<Packet>,
) {
    let (mut reader, mut writer) = tokio::io::split(local);
    let mut buffer = vec![0_u8; READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => match read {
                Ok(0) | Err(_) => {
                    trace!("local side closed, closing relay connection");
                    let _ = outbound.send(Packet::close_request(connect_id)).await;
                    break;
                }
                Ok(read) => {
                    if outbound.send(Packet::data(connect_id, buffer[..read].to_vec())).await.is_err() {
                        break;
                    }
                }
            },
            packet = inbound.message() => match packet {
                Ok(Some(Packet { payload: Some(Payload::Data(data)), .. })) if data.connect_id == connect_id => {
                    if !data.error.is_empty() {
                        warn!(error = %data.error, "relay reported a connection error");
                        break;
                    }
                    if writer.write_all(&data.data).await.is_err() {
                        let _ = outbound.send(Packet::close_request(connect_id)).await;
                        break;
                    }
                }
                Ok(Some(Packet { payload: Some(Payload::CloseResponse(_)), .. })) | Ok(None) => {
                    trace!("relay closed the connection");
                    break;
                }
                Ok(Some(_)) => trace!("ignoring unexpected packet"),
                Err(status) => {
                    warn!(error = &status as &dyn std::error::Error, "relay stream failed");
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn outbound_stream_opens_with_dial_request() {
        let (outbound, stream) = open_outbound("c1:443", 7);
        outbound.send(Packet::close_request(3)).await.unwrap();
        drop(outbound);

        let packets: Vec<Packet> = stream.collect().await;
        assert_eq!(
            packets,
            vec![Packet::dial_request("c1:443", 7), Packet::close_request(3)]
        );
    }

    #[tokio::test]
    async fn dial_fails_on_missing_material() {
        let dialer = GrpcTunnelDialer::new(RelayConfig {
            host: "relay.example".to_owned(),
            port: 8090,
            ca_cert_file: "/nonexistent/ca.crt".into(),
            cert_file: "/nonexistent/tls.crt".into(),
            key_file: "/nonexistent/tls.key".into(),
        });

        let err = dialer.dial("c1", "c1:443").await.unwrap_err();
        assert!(matches!(err, TunnelError::ReadTlsMaterial { .. }), "{err}");
    }
}
