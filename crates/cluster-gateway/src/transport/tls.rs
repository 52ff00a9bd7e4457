//! Client TLS configurations for backend clusters, cached by the fingerprint
//! of the material they were built from.
use std::{collections::HashMap, sync::Arc};

use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::sync::RwLock;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{
        CryptoProvider, WebPkiSupportedAlgorithms, ring::default_provider,
        verify_tls12_signature, verify_tls13_signature,
    },
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    version::{TLS12, TLS13},
};
use tracing::{debug, warn};

type Result<T, E = TlsError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum TlsError {
    #[snafu(display("server certificate verification is enabled but no CA bundle is available"))]
    MissingCaBundle,

    #[snafu(display("failed to parse PEM {material}"))]
    ParsePem {
        source: std::io::Error,
        material: &'static str,
    },

    #[snafu(display("the {material} PEM contains no certificate"))]
    EmptyPem { material: &'static str },

    #[snafu(display("the client key PEM contains no private key"))]
    MissingPrivateKey,

    #[snafu(display("failed to add CA certificate to root store"))]
    AddRootCertificate { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to configure client certificate"))]
    ConfigureClientCertificate { source: tokio_rustls::rustls::Error },
}

/// Inputs of a client TLS configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct TlsMaterial<'a> {
    pub ca_bundle: Option<&'a [u8]>,
    pub client_certificate: Option<&'a [u8]>,
    pub client_key: Option<&'a [u8]>,
    pub server_name: &'a str,

    /// Skip server certificate verification.
    pub insecure: bool,
}

type Fingerprint = [u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TlsCacheKey {
    ca: Option<Fingerprint>,
    certificate: Option<Fingerprint>,
    key: Option<Fingerprint>,
    server_name: String,
    insecure: bool,
}

impl TlsCacheKey {
    pub fn new(material: &TlsMaterial<'_>) -> Self {
        Self {
            ca: material.ca_bundle.map(fingerprint),
            certificate: material.client_certificate.map(fingerprint),
            key: material.client_key.map(fingerprint),
            server_name: material.server_name.to_owned(),
            insecure: material.insecure,
        }
    }
}

fn fingerprint(data: &[u8]) -> Fingerprint {
    Sha256::digest(data).into()
}

/// Cache of built client TLS configurations. Entries live as long as the
/// process; the key space is bounded by the distinct credential sets in use.
#[derive(Debug, Default)]
pub struct TlsConfigCache {
    entries: RwLock<HashMap<TlsCacheKey, Arc<ClientConfig>>>,
}

impl TlsConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_build(&self, material: &TlsMaterial<'_>) -> Result<Arc<ClientConfig>> {
        let key = TlsCacheKey::new(material);
        if let Some(config) = self.entries.read().await.get(&key) {
            return Ok(config.clone());
        }

        // Parsing happens outside the lock. If two builders race for the same
        // key, the first insert wins and both return that entry.
        let config = Arc::new(build_client_config(material)?);
        let mut entries = self.entries.write().await;
        Ok(entries.entry(key).or_insert(config).clone())
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub fn build_client_config(material: &TlsMaterial<'_>) -> Result<ClientConfig> {
    let provider = Arc::new(default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&TLS12, &TLS13])
        .context(SetSafeTlsProtocolVersionsSnafu)?;

    let builder = match (material.ca_bundle, material.insecure) {
        (_, true) => {
            warn!(
                server.name = material.server_name,
                "server certificate verification is disabled"
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoServerVerification::new(&provider)))
        }
        (Some(ca_bundle), false) => {
            let mut roots = RootCertStore::empty();
            for certificate in parse_certificates(ca_bundle, "CA bundle")? {
                roots.add(certificate).context(AddRootCertificateSnafu)?;
            }
            builder.with_root_certificates(roots)
        }
        (None, false) => return MissingCaBundleSnafu.fail(),
    };

    let mut config = match (material.client_certificate, material.client_key) {
        (Some(certificate), Some(key)) => {
            let chain = parse_certificates(certificate, "client certificate")?;
            let key = parse_private_key(key)?;
            builder
                .with_client_auth_cert(chain, key)
                .context(ConfigureClientCertificateSnafu)?
        }
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(server.name = material.server_name, "built client TLS config");
    Ok(config)
}

fn parse_certificates(
    mut pem: &[u8],
    material: &'static str,
) -> Result<Vec<CertificateDer<'static>>> {
    let certificates = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .context(ParsePemSnafu { material })?;
    ensure!(!certificates.is_empty(), EmptyPemSnafu { material });
    Ok(certificates)
}

fn parse_private_key(mut pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem)
        .context(ParsePemSnafu {
            material: "client key",
        })?
        .context(MissingPrivateKeySnafu)
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoServerVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoServerVerification {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use gateway_certs::{CertificatePair, ca::CertificateAuthority, keys::ecdsa};

    use super::*;

    struct Pems {
        ca: Vec<u8>,
        certificate: Vec<u8>,
        key: Vec<u8>,
    }

    fn pems() -> Pems {
        let ca = CertificateAuthority::<ecdsa::SigningKey>::builder()
            .build()
            .unwrap();
        let leaf = CertificatePair::<ecdsa::SigningKey>::builder()
            .subject("CN=client")
            .signed_by(&ca)
            .build()
            .unwrap();

        Pems {
            ca: ca.ca_cert_pem().unwrap().into_bytes(),
            certificate: leaf.certificate_pem().unwrap().into_bytes(),
            key: leaf.private_key_pem().unwrap().as_bytes().to_vec(),
        }
    }

    fn material(pems: &Pems) -> TlsMaterial<'_> {
        TlsMaterial {
            ca_bundle: Some(pems.ca.as_slice()),
            client_certificate: Some(pems.certificate.as_slice()),
            client_key: Some(pems.key.as_slice()),
            server_name: "c1.example",
            insecure: false,
        }
    }

    #[tokio::test]
    async fn repeated_builds_hit_the_cache() {
        let pems = pems();
        let cache = TlsConfigCache::new();

        let first = cache.get_or_build(&material(&pems)).await.unwrap();
        let second = cache.get_or_build(&material(&pems)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.entry_count().await, 1);
    }

    #[tokio::test]
    async fn changed_material_gets_its_own_entry() {
        let pems = pems();
        let cache = TlsConfigCache::new();
        let first = cache.get_or_build(&material(&pems)).await.unwrap();

        let mut key = pems.key.clone();
        key.push(b'\n');
        let changed = TlsMaterial {
            client_key: Some(key.as_slice()),
            ..material(&pems)
        };
        assert_ne!(TlsCacheKey::new(&material(&pems)), TlsCacheKey::new(&changed));

        let second = cache.get_or_build(&changed).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.entry_count().await, 2);
    }

    #[test]
    fn single_byte_change_changes_key() {
        let base = TlsMaterial {
            ca_bundle: Some(b"ca-a".as_slice()),
            server_name: "c1",
            ..Default::default()
        };
        let other = TlsMaterial {
            ca_bundle: Some(b"ca-b".as_slice()),
            ..base
        };
        assert_ne!(TlsCacheKey::new(&base), TlsCacheKey::new(&other));
    }

    #[test]
    fn verification_without_ca_is_rejected() {
        let err = build_client_config(&TlsMaterial {
            server_name: "c1",
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TlsError::MissingCaBundle));
    }

    #[test]
    fn insecure_without_ca_builds() {
        build_client_config(&TlsMaterial {
            server_name: "c1",
            insecure: true,
            ..Default::default()
        })
        .unwrap();
    }

    #[test]
    fn garbage_ca_is_rejected() {
        let err = build_client_config(&TlsMaterial {
            ca_bundle: Some(b"not a certificate".as_slice()),
            server_name: "c1",
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TlsError::EmptyPem { .. }), "{err}");
    }
}
