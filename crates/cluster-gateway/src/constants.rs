//! Well-known names shared with the control plane.
use std::time::Duration;

/// API group under which the gateway registers its `clustergateways`
/// resource.
pub const GATEWAY_API_GROUP: &str = "gateway.open-cluster-management.io";
pub const GATEWAY_API_VERSION: &str = "v1alpha1";
pub const GATEWAY_RESOURCE: &str = "clustergateways";

/// Name of the addon (and of the per-cluster credential secret) owned by the
/// gateway.
pub const ADDON_NAME: &str = "cluster-gateway";

/// Addon providing the konnectivity relay to managed clusters.
pub const CLUSTER_PROXY_ADDON_NAME: &str = "cluster-proxy";

pub const LABEL_KEY_CLUSTER_CREDENTIAL_TYPE: &str =
    "gateway.open-cluster-management.io/cluster-credential-type";
pub const LABEL_KEY_MANAGED_SERVICE_ACCOUNT: &str =
    "authentication.open-cluster-management.io/is-managed-serviceaccount";

pub const ANNOTATION_KEY_PROXY_URL: &str = "proxy-url";
pub const ANNOTATION_KEY_HEALTHY: &str = "status.gateway.open-cluster-management.io/healthy";
pub const ANNOTATION_KEY_HEALTHY_REASON: &str =
    "status.gateway.open-cluster-management.io/healthy-reason";
pub const ANNOTATION_KEY_PROXY_CONFIGURATION: &str =
    "gateway.open-cluster-management.io/cluster-gateway-proxy-configuration";

pub const CONDITION_TYPE_AVAILABLE: &str = "Available";

/// Extra key carrying the organisation an end user acts for.
pub const EXTRA_KEY_ORG_ID: &str = "ace.appscode.com/org-id";

/// Extras asserted by the backend's token authenticator which the gateway is
/// not allowed to impersonate for service accounts.
pub const RESERVED_EXTRA_PREFIX: &str = "authentication.kubernetes.io/";

pub const SERVICE_ACCOUNT_USER_PREFIX: &str = "system:serviceaccount:";

pub const DEFAULT_CLUSTER_AUTH_NAMESPACE: &str = "open-cluster-management-cluster-auth";

/// Name of the secret holding a CA generated by the gateway.
pub const DEFAULT_CA_SECRET_NAME: &str = "cluster-gateway-ca";

/// Name of the secret holding the gateway's serving certificate.
pub const DEFAULT_SERVER_CERT_SECRET_NAME: &str = "cluster-gateway-tls-cert";

/// Service name the serving certificate SANs are derived from.
pub const SERVICE_NAME: &str = "cluster-gateway";

/// Liveness path probed on every backend.
pub const HEALTHZ_PATH: &str = "/healthz";
pub const HEALTHZ_EXPECTED_BODY: &str = "ok";

/// Ceiling for non-upgraded requests, measured from transport acquisition.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(40);

/// Delay before an unhealthy cluster is probed again.
pub const UNHEALTHY_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Keepalive ping interval on the tunnel relay channel.
pub const TUNNEL_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_BIND_PORT: u16 = 9443;
pub const DEFAULT_TUNNEL_PORT: u16 = 8090;
