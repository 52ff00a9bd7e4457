//! Command line arguments of the `cluster-gateway` binary.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser};
use gateway_telemetry::TelemetryOptions;

use crate::{
    constants::{
        DEFAULT_BIND_PORT, DEFAULT_CA_SECRET_NAME, DEFAULT_CLUSTER_AUTH_NAMESPACE,
        DEFAULT_SERVER_CERT_SECRET_NAME, DEFAULT_TUNNEL_PORT,
    },
    tunnel::RelayConfig,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = "cluster-gateway", author, version, about = "Multi-cluster API gateway")]
pub enum Command {
    /// Run the gateway.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Address the HTTPS server binds to.
    #[arg(long, env, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_address: IpAddr,

    /// Port the HTTPS server binds to.
    #[arg(long, env, default_value_t = DEFAULT_BIND_PORT)]
    pub bind_port: u16,

    /// Namespace the gateway runs in. The serving certificate secret lives
    /// here.
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// Namespace of the addon manager, also covered by the serving
    /// certificate. Defaults to the gateway's namespace.
    #[arg(long, env)]
    pub addon_manager_namespace: Option<String>,

    /// Namespace holding the broker service accounts which may act for
    /// platform accounts.
    #[arg(long, env, default_value = DEFAULT_CLUSTER_AUTH_NAMESPACE)]
    pub cluster_auth_namespace: String,

    /// Global identity exchange rules (a ClusterGatewayProxyConfiguration
    /// YAML document).
    #[arg(long, env, value_name = "FILE")]
    pub proxy_config_file: Option<PathBuf>,

    /// Authorize proxied requests against the path they target on the
    /// backend cluster.
    #[arg(long, env)]
    pub authorize_proxy_subpath: bool,

    /// Exchange the caller identity even if the request does not ask for it.
    #[arg(long, env)]
    pub impersonate_by_default: bool,

    /// Trust caller identity headers only on connections presenting a client
    /// certificate signed by this CA.
    #[arg(long, env, value_name = "FILE")]
    pub requestheader_client_ca_file: Option<PathBuf>,

    /// Interval in which the health of every cluster is reconciled.
    #[arg(long, env, default_value = "1s", value_parser = humantime::parse_duration)]
    pub health_probe_interval: Duration,

    /// Number of clusters probed concurrently.
    #[arg(long, env, default_value_t = 4)]
    pub health_probe_workers: usize,

    #[command(flatten)]
    pub certificates: CertificateOptions,

    #[command(flatten)]
    pub tunnel: TunnelOptions,

    // All (flattened) sub structs should be placed at the end to ensure the
    // help headings are correct.
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

impl RunArguments {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    pub fn addon_manager_namespace(&self) -> &str {
        self.addon_manager_namespace
            .as_deref()
            .unwrap_or(&self.namespace)
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct CertificateOptions {
    /// CA certificate signing the serving certificate. Without CA files,
    /// the CA persisted in `--ca-secret-name` is used, and generated if that
    /// secret does not exist yet.
    #[arg(long, env, value_name = "FILE", requires = "ca_key_file")]
    pub ca_cert_file: Option<PathBuf>,

    /// Private key (PKCS#8 PEM) of the CA.
    #[arg(long, env, value_name = "FILE", requires = "ca_cert_file")]
    pub ca_key_file: Option<PathBuf>,

    /// Secret a generated CA is persisted in.
    #[arg(long, env, default_value = DEFAULT_CA_SECRET_NAME)]
    pub ca_secret_name: String,

    /// Secret the serving certificate is persisted in.
    #[arg(long, env, default_value = DEFAULT_SERVER_CERT_SECRET_NAME)]
    pub server_cert_secret_name: String,

    /// Validity of issued serving certificates.
    #[arg(long, env, default_value = "180d", value_parser = humantime::parse_duration)]
    pub server_cert_validity: Duration,

    /// Interval in which the serving certificate is checked.
    #[arg(long, env, default_value = "1h", value_parser = humantime::parse_duration)]
    pub server_cert_resync_interval: Duration,
}

/// The relay tunneled clusters are reached through.
#[derive(Debug, PartialEq, Eq, Args)]
pub struct TunnelOptions {
    /// Host of the tunnel relay. Tunneled clusters are unreachable without
    /// it.
    #[arg(long, env, requires_all = ["proxy_ca_cert", "proxy_cert", "proxy_key"])]
    pub proxy_host: Option<String>,

    #[arg(long, env, default_value_t = DEFAULT_TUNNEL_PORT)]
    pub proxy_port: u16,

    /// CA certificate the relay's serving certificate is verified with.
    #[arg(long, env, value_name = "FILE")]
    pub proxy_ca_cert: Option<PathBuf>,

    /// Client certificate presented to the relay.
    #[arg(long, env, value_name = "FILE")]
    pub proxy_cert: Option<PathBuf>,

    /// Private key of the client certificate.
    #[arg(long, env, value_name = "FILE")]
    pub proxy_key: Option<PathBuf>,
}

impl TunnelOptions {
    pub fn relay_config(&self) -> Option<RelayConfig> {
        Some(RelayConfig {
            host: self.proxy_host.clone()?,
            port: self.proxy_port,
            ca_cert_file: self.proxy_ca_cert.clone()?,
            cert_file: self.proxy_cert.clone()?,
            key_file: self.proxy_key.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;

        Command::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let Command::Run(arguments) =
            Command::try_parse_from(["cluster-gateway", "run", "--namespace", "gw"]).unwrap();

        assert_eq!(arguments.socket_addr(), "0.0.0.0:9443".parse().unwrap());
        assert_eq!(arguments.addon_manager_namespace(), "gw");
        assert_eq!(arguments.certificates.ca_secret_name, "cluster-gateway-ca");
        assert_eq!(
            arguments.certificates.server_cert_validity,
            Duration::from_secs(180 * 24 * 60 * 60)
        );
        assert_eq!(arguments.health_probe_interval, Duration::from_secs(1));
        assert!(arguments.tunnel.relay_config().is_none());
        assert!(!arguments.impersonate_by_default);
    }

    #[test]
    fn relay_requires_identity() {
        let result = Command::try_parse_from([
            "cluster-gateway",
            "run",
            "--namespace",
            "gw",
            "--proxy-host",
            "relay.example",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn relay_config() {
        let Command::Run(arguments) = Command::try_parse_from([
            "cluster-gateway",
            "run",
            "--namespace",
            "gw",
            "--proxy-host",
            "relay.example",
            "--proxy-ca-cert",
            "/ca.crt",
            "--proxy-cert",
            "/tls.crt",
            "--proxy-key",
            "/tls.key",
        ])
        .unwrap();

        let relay = arguments.tunnel.relay_config().unwrap();
        assert_eq!(relay.host, "relay.example");
        assert_eq!(relay.port, 8090);
    }
}
