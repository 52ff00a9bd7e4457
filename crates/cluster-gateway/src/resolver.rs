//! Resolution of a cluster name into the material needed to reach it.
//!
//! The resolver never caches: the record store is the source of truth and
//! may change between two requests.
use std::fmt;

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

use crate::{
    constants::{
        ADDON_NAME, ANNOTATION_KEY_PROXY_CONFIGURATION, ANNOTATION_KEY_PROXY_URL,
        CLUSTER_PROXY_ADDON_NAME, CONDITION_TYPE_AVAILABLE, LABEL_KEY_CLUSTER_CREDENTIAL_TYPE,
        LABEL_KEY_MANAGED_SERVICE_ACCOUNT,
    },
    identity::rules::{self, ExchangeRule},
    store::{AddonRecord, ClusterRecord, SecretRecord, SharedRecordStore, StoreError},
};

const CREDENTIAL_TYPE_SERVICE_ACCOUNT_TOKEN: &str = "ServiceAccountToken";
const CREDENTIAL_TYPE_X509_CERTIFICATE: &str = "X509Certificate";

const SECRET_KEY_TOKEN: &str = "token";
const SECRET_KEY_TLS_CERT: &str = "tls.crt";
const SECRET_KEY_TLS_KEY: &str = "tls.key";

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("cluster {cluster:?} not found"))]
    NotFound { source: StoreError, cluster: String },

    #[snafu(display("failed to read the records of cluster {cluster:?}"))]
    ReadRecords { source: StoreError, cluster: String },

    #[snafu(display("cluster {cluster:?} has no endpoint address"))]
    MissingEndpointAddress { cluster: String },

    #[snafu(display("invalid proxy URL {proxy_url:?} for cluster {cluster:?}"))]
    InvalidProxyUrl {
        source: url::ParseError,
        cluster: String,
        proxy_url: String,
    },

    #[snafu(display("credential secret of cluster {cluster:?} has no credential type"))]
    MissingCredentialType { cluster: String },

    #[snafu(display("unrecognized secret credential type {credential_type:?}"))]
    UnrecognizedCredentialType {
        cluster: String,
        credential_type: String,
    },

    #[snafu(display("bearer token of cluster {cluster:?} is not valid UTF-8"))]
    InvalidToken {
        source: std::string::FromUtf8Error,
        cluster: String,
    },

    #[snafu(display("invalid proxy configuration for cluster {cluster:?}"))]
    InvalidExchangeRules { source: rules::Error, cluster: String },
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Records exist but cannot be turned into a usable descriptor.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::ReadRecords { .. })
    }
}

/// Everything needed to send a request to one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub cluster: String,
    pub endpoint: Endpoint,

    /// [`None`] when the credential secret holds no material for its
    /// declared type. Such a descriptor cannot be used for proxying.
    pub credential: Option<Credential>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Direct(DirectEndpoint),

    /// Reached through the tunnel relay, which routes by cluster name.
    Tunneled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectEndpoint {
    pub address: String,
    pub ca_bundle: Option<Vec<u8>>,
    pub insecure: bool,
    pub proxy_url: Option<Url>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    BearerToken(Zeroizing<String>),
    X509 {
        certificate_pem: Vec<u8>,
        private_key_pem: Zeroizing<Vec<u8>>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
            Self::X509 { .. } => f.write_str("X509(<redacted>)"),
        }
    }
}

/// A descriptor together with the identity exchange rules attached to the
/// cluster.
#[derive(Clone, Debug)]
pub struct ResolvedCluster {
    pub descriptor: ConnectionDescriptor,
    pub exchange_rules: Vec<ExchangeRule>,
}

#[derive(Clone)]
pub struct Resolver {
    store: SharedRecordStore,
    tunnel_enabled: bool,
}

impl Resolver {
    /// `tunnel_enabled` tells whether a tunnel relay is configured at all.
    pub fn new(store: SharedRecordStore, tunnel_enabled: bool) -> Self {
        Self {
            store,
            tunnel_enabled,
        }
    }

    pub async fn resolve(&self, cluster: &str) -> Result<ConnectionDescriptor, ResolveError> {
        Ok(self.resolve_cluster(cluster).await?.descriptor)
    }

    #[instrument(name = "resolve_cluster", skip(self))]
    pub async fn resolve_cluster(&self, cluster: &str) -> Result<ResolvedCluster, ResolveError> {
        let record = self
            .store
            .get_cluster(cluster)
            .await
            .map_err(|source| store_error(source, cluster))?;
        let addon = self
            .store
            .get_addon(cluster, ADDON_NAME)
            .await
            .map_err(|source| store_error(source, cluster))?;
        let secret = self
            .store
            .get_secret(cluster, ADDON_NAME)
            .await
            .map_err(|source| store_error(source, cluster))?;

        let endpoint = if self.is_tunneled(cluster).await {
            Endpoint::Tunneled
        } else {
            debug!("using the direct endpoint type");
            Endpoint::Direct(direct_endpoint(&record, &addon)?)
        };

        let descriptor = ConnectionDescriptor {
            cluster: cluster.to_owned(),
            endpoint,
            credential: credential(cluster, &secret)?,
        };

        let exchange_rules = match addon.annotations.get(ANNOTATION_KEY_PROXY_CONFIGURATION) {
            Some(document) => rules::parse_rules(document, Some(cluster))
                .context(InvalidExchangeRulesSnafu { cluster })?,
            None => Vec::new(),
        };

        Ok(ResolvedCluster {
            descriptor,
            exchange_rules,
        })
    }

    /// A cluster is tunneled when a relay is configured and the relay addon
    /// reports itself available for the cluster.
    async fn is_tunneled(&self, cluster: &str) -> bool {
        if !self.tunnel_enabled {
            return false;
        }

        match self.store.get_addon(cluster, CLUSTER_PROXY_ADDON_NAME).await {
            Ok(addon) => addon.is_condition_true(CONDITION_TYPE_AVAILABLE),
            Err(error) => {
                debug!(
                    error = &error as &dyn std::error::Error,
                    "relay addon unavailable, not tunneling"
                );
                false
            }
        }
    }
}

fn store_error(source: StoreError, cluster: &str) -> ResolveError {
    if source.is_not_found() {
        ResolveError::NotFound {
            source,
            cluster: cluster.to_owned(),
        }
    } else {
        ResolveError::ReadRecords {
            source,
            cluster: cluster.to_owned(),
        }
    }
}

fn direct_endpoint(
    record: &ClusterRecord,
    addon: &AddonRecord,
) -> Result<DirectEndpoint, ResolveError> {
    let client_config = record.client_configs.first();
    let address = client_config
        .map(|config| config.url.clone())
        .unwrap_or_default();
    ensure!(
        !address.is_empty(),
        MissingEndpointAddressSnafu {
            cluster: &record.name
        }
    );

    let ca_bundle = client_config.and_then(|config| config.ca_bundle.clone());
    let proxy_url = addon
        .annotations
        .get(ANNOTATION_KEY_PROXY_URL)
        .filter(|url| !url.is_empty())
        .map(|url| {
            Url::parse(url).context(InvalidProxyUrlSnafu {
                cluster: &record.name,
                proxy_url: url,
            })
        })
        .transpose()?;

    Ok(DirectEndpoint {
        address,
        insecure: ca_bundle.is_none(),
        ca_bundle,
        proxy_url,
    })
}

fn credential(cluster: &str, secret: &SecretRecord) -> Result<Option<Credential>, ResolveError> {
    let credential_type = match secret.labels.get(LABEL_KEY_CLUSTER_CREDENTIAL_TYPE) {
        Some(credential_type) => credential_type.as_str(),
        None => {
            ensure!(
                secret
                    .labels
                    .get(LABEL_KEY_MANAGED_SERVICE_ACCOUNT)
                    .is_some_and(|value| value == "true"),
                MissingCredentialTypeSnafu { cluster }
            );
            CREDENTIAL_TYPE_SERVICE_ACCOUNT_TOKEN
        }
    };

    match credential_type {
        CREDENTIAL_TYPE_SERVICE_ACCOUNT_TOKEN => secret
            .data(SECRET_KEY_TOKEN)
            .map(|token| {
                String::from_utf8(token.to_vec())
                    .map(|token| Credential::BearerToken(Zeroizing::new(token)))
                    .context(InvalidTokenSnafu { cluster })
            })
            .transpose(),
        CREDENTIAL_TYPE_X509_CERTIFICATE => Ok(secret
            .data(SECRET_KEY_TLS_CERT)
            .zip(secret.data(SECRET_KEY_TLS_KEY))
            .map(|(certificate, key)| Credential::X509 {
                certificate_pem: certificate.to_vec(),
                private_key_pem: Zeroizing::new(key.to_vec()),
            })),
        credential_type => UnrecognizedCredentialTypeSnafu {
            cluster,
            credential_type,
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::store::{ClientConfig, Condition, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        async fn new(labels: &[(&str, &str)], data: &[(&str, &[u8])]) -> Self {
            let store = Arc::new(MemoryStore::new());
            store
                .insert_cluster(ClusterRecord {
                    name: "c1".to_owned(),
                    client_configs: vec![ClientConfig {
                        url: "https://c1.example:6443".to_owned(),
                        ca_bundle: Some(b"ca".to_vec()),
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
                    labels: labels
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                    data: data
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), v.to_vec()))
                        .collect(),
                    ..Default::default()
                })
                .await;
            Self { store }
        }

        fn resolver(&self, tunnel_enabled: bool) -> Resolver {
            Resolver::new(self.store.clone(), tunnel_enabled)
        }

        async fn set_addon(&self, name: &str, annotations: &[(&str, &str)], available: bool) {
            self.store
                .insert_addon(AddonRecord {
                    cluster: "c1".to_owned(),
                    name: name.to_owned(),
                    annotations: annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                    conditions: vec![Condition {
                        type_: CONDITION_TYPE_AVAILABLE.to_owned(),
                        status: available,
                        ..Default::default()
                    }],
                    resource_version: None,
                })
                .await;
        }
    }

    const TOKEN_LABELS: &[(&str, &str)] = &[(
        LABEL_KEY_CLUSTER_CREDENTIAL_TYPE,
        CREDENTIAL_TYPE_SERVICE_ACCOUNT_TOKEN,
    )];

    #[tokio::test]
    async fn resolves_direct_token_cluster() {
        let fixture = Fixture::new(TOKEN_LABELS, &[("token", b"secret-token")]).await;

        let descriptor = fixture.resolver(false).resolve("c1").await.unwrap();
        assert_eq!(
            descriptor.endpoint,
            Endpoint::Direct(DirectEndpoint {
                address: "https://c1.example:6443".to_owned(),
                ca_bundle: Some(b"ca".to_vec()),
                insecure: false,
                proxy_url: None,
            })
        );
        assert_eq!(
            descriptor.credential,
            Some(Credential::BearerToken(Zeroizing::new(
                "secret-token".to_owned()
            )))
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let fixture = Fixture::new(TOKEN_LABELS, &[]).await;
        let err = fixture.resolver(false).resolve("nope").await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[rstest]
    #[case::no_marker(&[], "has no credential type")]
    #[case::unknown_type(
        &[(LABEL_KEY_CLUSTER_CREDENTIAL_TYPE, "Kerberos")],
        "unrecognized secret credential type"
    )]
    #[tokio::test]
    async fn malformed_credential_type(
        #[case] labels: &[(&str, &str)],
        #[case] message: &str,
    ) {
        let fixture = Fixture::new(labels, &[("token", b"t")]).await;
        let err = fixture.resolver(false).resolve("c1").await.unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains(message), "{err}");
    }

    #[tokio::test]
    async fn managed_service_account_defaults_to_token() {
        let fixture = Fixture::new(
            &[(LABEL_KEY_MANAGED_SERVICE_ACCOUNT, "true")],
            &[("token", b"t")],
        )
        .await;
        let descriptor = fixture.resolver(false).resolve("c1").await.unwrap();
        assert!(matches!(
            descriptor.credential,
            Some(Credential::BearerToken(_))
        ));
    }

    #[tokio::test]
    async fn empty_material_means_no_credential() {
        let fixture = Fixture::new(
            &[(
                LABEL_KEY_CLUSTER_CREDENTIAL_TYPE,
                CREDENTIAL_TYPE_X509_CERTIFICATE,
            )],
            &[("tls.crt", b"cert"), ("tls.key", b"")],
        )
        .await;
        let descriptor = fixture.resolver(false).resolve("c1").await.unwrap();
        assert_eq!(descriptor.credential, None);
    }

    #[rstest]
    #[case::relay_available(true, true, Endpoint::Tunneled)]
    #[case::relay_unavailable(true, false, Endpoint::Direct(DirectEndpoint {
        address: "https://c1.example:6443".to_owned(),
        ca_bundle: Some(b"ca".to_vec()),
        insecure: false,
        proxy_url: None,
    }))]
    #[case::relay_not_configured(false, true, Endpoint::Direct(DirectEndpoint {
        address: "https://c1.example:6443".to_owned(),
        ca_bundle: Some(b"ca".to_vec()),
        insecure: false,
        proxy_url: None,
    }))]
    #[tokio::test]
    async fn endpoint_type_follows_relay_addon(
        #[case] tunnel_enabled: bool,
        #[case] relay_available: bool,
        #[case] expected: Endpoint,
    ) {
        let fixture = Fixture::new(TOKEN_LABELS, &[("token", b"t")]).await;
        fixture
            .set_addon(CLUSTER_PROXY_ADDON_NAME, &[], relay_available)
            .await;

        let descriptor = fixture.resolver(tunnel_enabled).resolve("c1").await.unwrap();
        assert_eq!(descriptor.endpoint, expected);
    }

    #[tokio::test]
    async fn missing_address_is_malformed() {
        let fixture = Fixture::new(TOKEN_LABELS, &[("token", b"t")]).await;
        fixture
            .store
            .insert_cluster(ClusterRecord {
                name: "c1".to_owned(),
                client_configs: Vec::new(),
            })
            .await;

        let err = fixture.resolver(false).resolve("c1").await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingEndpointAddress { .. }));
    }

    #[tokio::test]
    async fn addon_annotations_feed_proxy_url_and_rules() {
        let fixture = Fixture::new(TOKEN_LABELS, &[("token", b"t")]).await;
        let rules = r#"
spec:
  clientIdentityExchanger:
    rules:
      - name: admins
        type: PrivilegedIdentityExchanger
        source:
          user: admin
"#;
        fixture
            .set_addon(
                ADDON_NAME,
                &[
                    (ANNOTATION_KEY_PROXY_URL, "http://squid.example:3128"),
                    (ANNOTATION_KEY_PROXY_CONFIGURATION, rules),
                ],
                true,
            )
            .await;

        let resolved = fixture.resolver(false).resolve_cluster("c1").await.unwrap();
        let Endpoint::Direct(endpoint) = &resolved.descriptor.endpoint else {
            panic!("expected a direct endpoint");
        };
        assert_eq!(
            endpoint.proxy_url.as_ref().map(Url::as_str),
            Some("http://squid.example:3128/")
        );
        assert_eq!(resolved.exchange_rules.len(), 1);

        let admin = crate::identity::Identity::user("admin");
        assert!(resolved.exchange_rules[0].matches(&admin, "c1"));
        assert!(!resolved.exchange_rules[0].matches(&admin, "c2"));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::BearerToken(Zeroizing::new("hunter2".to_owned()));
        assert!(!format!("{credential:?}").contains("hunter2"));
    }
}
