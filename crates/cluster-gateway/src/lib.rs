//! A multi-cluster API gateway.
//!
//! Requests to `/apis/gateway.open-cluster-management.io/v1alpha1/clustergateways/{cluster}/proxy/...`
//! are forwarded to the API server of `{cluster}`, using the connection
//! material the control plane stores for it and an identity derived from
//! the caller. Besides proxying, the gateway continuously probes every
//! cluster's reachability and keeps its own serving certificate valid.
//!
//! [`run`] wires all components together; every component can also be
//! constructed on its own with an injected [`store::RecordStore`].
use std::sync::Arc;

use futures_util::{FutureExt as _, pin_mut, select};
use gateway_certs::{
    ca::{CertificateAuthority, LoadCertificateAuthorityError},
    keys::ecdsa,
};
use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};

use crate::{
    cli::RunArguments,
    constants::ADDON_NAME,
    health::HealthProber,
    identity::{IdentityExchanger, rules},
    proxy::{Authorizer, ProxyState, SubjectAccessReviewAuthorizer, TracingMetrics},
    resolver::Resolver,
    rotation::{CertificateRotator, RotationError},
    server::{CertificateResolver, CertificateResolverError, GatewayServer, ServerError},
    store::{KubeStore, SharedRecordStore, StoreError},
    transport::TransportBuilder,
    tunnel::{GrpcTunnelDialer, TunnelDialer},
};

pub mod cli;
pub mod constants;
pub mod health;
pub mod identity;
pub mod proxy;
pub mod resolver;
pub mod rotation;
pub mod server;
pub mod store;
pub mod transport;
pub mod tunnel;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateKubeClient { source: kube::Error },

    #[snafu(display("failed to reach the record store"))]
    ReachRecordStore { source: StoreError },

    #[snafu(display("failed to load certificate authority"))]
    LoadCertificateAuthority {
        source: LoadCertificateAuthorityError<ecdsa::Error>,
    },

    #[snafu(display("failed to obtain persisted certificate authority"))]
    PersistCertificateAuthority { source: RotationError },

    #[snafu(display("failed to load global proxy configuration"))]
    LoadProxyConfiguration { source: rules::Error },

    #[snafu(display("failed to obtain serving certificate"))]
    ObtainServingCertificate { source: RotationError },

    #[snafu(display("failed to create certificate resolver"))]
    CreateCertificateResolver { source: CertificateResolverError },

    #[snafu(display("failed to create HTTPS server"))]
    CreateServer { source: ServerError },

    #[snafu(display("failed to run HTTPS server"))]
    RunServer { source: ServerError },

    #[snafu(display("failed to set up shutdown signal handlers"))]
    ShutdownSignal { source: ServerError },
}

async fn certificate_authority(
    arguments: &RunArguments,
    store: &SharedRecordStore,
) -> Result<CertificateAuthority<ecdsa::SigningKey>, Error> {
    let certificates = &arguments.certificates;
    match (&certificates.ca_cert_file, &certificates.ca_key_file) {
        (Some(ca_cert_file), Some(ca_key_file)) => {
            CertificateAuthority::from_files(ca_cert_file, ca_key_file)
                .context(LoadCertificateAuthoritySnafu)
        }
        _ => {
            info!(
                secret.name = %certificates.ca_secret_name,
                "no CA files configured, using persisted certificate authority"
            );
            rotation::persisted_certificate_authority(
                store,
                &arguments.namespace,
                &certificates.ca_secret_name,
            )
            .await
            .context(PersistCertificateAuthoritySnafu)
        }
    }
}

/// Runs the gateway until SIGINT or SIGTERM is received.
#[instrument(name = "run_gateway", skip(arguments))]
pub async fn run(arguments: RunArguments) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .context(CreateKubeClientSnafu)?;
    let store: SharedRecordStore = Arc::new(KubeStore::new(client.clone()));
    store
        .list_addons(ADDON_NAME)
        .await
        .context(ReachRecordStoreSnafu)?;

    let global_rules = match &arguments.proxy_config_file {
        Some(path) => rules::load_rules_file(path).context(LoadProxyConfigurationSnafu)?,
        None => Vec::new(),
    };

    let ca = Arc::new(certificate_authority(&arguments, &store).await?);
    let rotator = CertificateRotator::new(
        store.clone(),
        ca,
        &arguments.namespace,
        &arguments.certificates.server_cert_secret_name,
        rotation::serving_dns_names(&arguments.namespace, arguments.addon_manager_namespace()),
        arguments.certificates.server_cert_validity,
    );
    let rotation = rotator
        .rotate()
        .await
        .context(ObtainServingCertificateSnafu)?;
    let cert_resolver = Arc::new(
        CertificateResolver::new(&rotation.certificate).context(CreateCertificateResolverSnafu)?,
    );

    let tunnel = arguments.tunnel.relay_config().map(|relay| {
        info!(relay.host = %relay.host, relay.port = relay.port, "tunnel relay configured");
        Arc::new(GrpcTunnelDialer::new(relay)) as Arc<dyn TunnelDialer>
    });
    let resolver = Arc::new(Resolver::new(store.clone(), tunnel.is_some()));
    let transports = Arc::new(TransportBuilder::new(tunnel));
    let exchanger = Arc::new(IdentityExchanger::new(
        store.clone(),
        global_rules,
        &arguments.cluster_auth_namespace,
    ));
    let authorizer = arguments.authorize_proxy_subpath.then(|| {
        Arc::new(SubjectAccessReviewAuthorizer::new(client.clone())) as Arc<dyn Authorizer>
    });

    let router = proxy::router(ProxyState {
        store: store.clone(),
        resolver: resolver.clone(),
        transports: transports.clone(),
        exchanger,
        authorizer,
        metrics: Arc::new(TracingMetrics),
        impersonate_by_default: arguments.impersonate_by_default,
    });
    let server = GatewayServer::new(
        arguments.socket_addr(),
        router,
        cert_resolver.clone(),
        arguments.requestheader_client_ca_file.as_deref(),
    )
    .context(CreateServerSnafu)?;

    let prober = HealthProber::new(store, resolver, transports);

    let server = server.run().fuse();
    let rotation = rotator
        .run(cert_resolver, arguments.certificates.server_cert_resync_interval)
        .fuse();
    let health = prober
        .run(
            client,
            arguments.health_probe_interval,
            arguments.health_probe_workers,
        )
        .fuse();
    let shutdown = server::shutdown_signal().fuse();
    pin_mut!(server, rotation, health, shutdown);

    info!(socket_addr = %arguments.socket_addr(), "cluster gateway started");
    select! {
        result = server => result.context(RunServerSnafu)?,
        () = rotation => {},
        () = health => {},
        result = shutdown => result.context(ShutdownSignalSnafu)?,
    }

    Ok(())
}
