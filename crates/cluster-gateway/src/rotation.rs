//! Keeps the gateway's serving certificate valid.
//!
//! The certificate is persisted in a `kubernetes.io/tls` secret so that all
//! replicas serve the same certificate. Every replica runs the rotation; the
//! first writer wins and the others pick up its certificate on their next
//! round.
use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, SystemTime},
};

use gateway_certs::{
    CertificatePair, CertificatePairError,
    ca::{CertificateAuthority, CreateCertificateAuthorityError},
    cert_builder::CreateCertificateError,
    inspect::CertificateInfo,
    keys::ecdsa,
};
use snafu::{ResultExt, Snafu};
use strum::Display;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    constants::SERVICE_NAME,
    server::CertificateResolver,
    store::{SecretRecord, SharedRecordStore, StoreError},
};

pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const SECRET_KEY_TLS_CERT: &str = "tls.crt";
pub const SECRET_KEY_TLS_KEY: &str = "tls.key";
pub const SECRET_KEY_CA_CERT: &str = "ca.crt";

/// A certificate is reissued once less than this share of its validity
/// window is left.
const REISSUE_REMAINING_FRACTION: u32 = 5;

pub type Result<T, E = RotationError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum RotationError {
    #[snafu(display("failed to read serving certificate secret {namespace}/{name}"))]
    ReadSecret {
        source: StoreError,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to write serving certificate secret {namespace}/{name}"))]
    WriteSecret {
        source: StoreError,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to issue serving certificate"))]
    IssueCertificate {
        source: CreateCertificateError<ecdsa::Error>,
    },

    #[snafu(display("failed to encode serving certificate"))]
    EncodeCertificate {
        source: CertificatePairError<ecdsa::Error>,
    },

    #[snafu(display("failed to create certificate authority"))]
    CreateCertificateAuthority {
        source: CreateCertificateAuthorityError<ecdsa::Error>,
    },

    #[snafu(display("secret {namespace}/{name} does not hold a certificate authority"))]
    IncompleteCertificateAuthority { namespace: String, name: String },

    #[snafu(display("failed to decode certificate authority from secret {namespace}/{name}"))]
    DecodeCertificateAuthority {
        source: CertificatePairError<ecdsa::Error>,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to run task in blocking thread"))]
    TokioSpawnBlocking { source: tokio::task::JoinError },
}

/// Why a persisted certificate is replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ReissueReason {
    Missing,
    Unreadable,
    Expired,
    SubjectAlternativeNamesChanged,
    IssuerChanged,
    NearingExpiry,
    CaBundleChanged,
}

/// What a rotation round did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    Unchanged,
    Issued(ReissueReason),
    /// Another writer updated the secret first; its certificate is used.
    LostRace,
}

/// The certificate in effect after a rotation round.
pub struct Rotation {
    pub outcome: RotationOutcome,
    pub certificate: CertificatePair<ecdsa::SigningKey>,
}

/// SANs of the serving certificate: the service name in the gateway's
/// namespace, and in the addon manager's namespace if it differs.
pub fn serving_dns_names(namespace: &str, addon_manager_namespace: &str) -> Vec<String> {
    let mut dns_names = vec![
        SERVICE_NAME.to_owned(),
        format!("{SERVICE_NAME}.{namespace}"),
        format!("{SERVICE_NAME}.{namespace}.svc"),
    ];
    if namespace != addon_manager_namespace {
        dns_names.push(format!("{SERVICE_NAME}.{addon_manager_namespace}"));
        dns_names.push(format!("{SERVICE_NAME}.{addon_manager_namespace}.svc"));
    }
    dns_names
}

/// Loads the CA persisted in the `kubernetes.io/tls` secret
/// `namespace`/`name`, generating and persisting one if the secret does not
/// exist. Replicas starting at the same time all end up with the CA of the
/// first writer.
#[instrument(
    name = "load_persisted_certificate_authority",
    skip(store),
    fields(secret.namespace = %namespace, secret.name = %name),
)]
pub async fn persisted_certificate_authority(
    store: &SharedRecordStore,
    namespace: &str,
    name: &str,
) -> Result<CertificateAuthority<ecdsa::SigningKey>> {
    match store.get_secret(namespace, name).await {
        Ok(secret) => return certificate_authority_from_secret(&secret),
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err).context(ReadSecretSnafu { namespace, name }),
    }

    info!("generating certificate authority");
    let ca = tokio::task::spawn_blocking(|| {
        CertificateAuthority::<ecdsa::SigningKey>::builder()
            .build()
            .context(CreateCertificateAuthoritySnafu)
    })
    .await
    .context(TokioSpawnBlockingSnafu)??;

    let certificate_pair = ca.certificate_pair();
    let private_key_pem = certificate_pair
        .private_key_pem()
        .context(EncodeCertificateSnafu)?;
    let secret = SecretRecord {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        type_: Some(SECRET_TYPE_TLS.to_owned()),
        data: [
            (
                SECRET_KEY_TLS_CERT.to_owned(),
                certificate_pair
                    .certificate_pem()
                    .context(EncodeCertificateSnafu)?
                    .into_bytes(),
            ),
            (
                SECRET_KEY_TLS_KEY.to_owned(),
                private_key_pem.as_bytes().to_vec(),
            ),
        ]
        .into(),
        ..Default::default()
    };

    match store.create_secret(&secret).await {
        Ok(_) => Ok(ca),
        Err(err) if err.is_conflict() => {
            debug!("certificate authority was persisted concurrently");
            let secret = store
                .get_secret(namespace, name)
                .await
                .context(ReadSecretSnafu { namespace, name })?;
            certificate_authority_from_secret(&secret)
        }
        Err(err) => Err(err).context(WriteSecretSnafu { namespace, name }),
    }
}

fn certificate_authority_from_secret(
    secret: &SecretRecord,
) -> Result<CertificateAuthority<ecdsa::SigningKey>> {
    let (Some(certificate_pem), Some(private_key_pem)) = (
        secret.data(SECRET_KEY_TLS_CERT),
        secret.data(SECRET_KEY_TLS_KEY),
    ) else {
        return IncompleteCertificateAuthoritySnafu {
            namespace: &secret.namespace,
            name: &secret.name,
        }
        .fail();
    };

    let certificate_pair = CertificatePair::from_pem(certificate_pem, private_key_pem).context(
        DecodeCertificateAuthoritySnafu {
            namespace: &secret.namespace,
            name: &secret.name,
        },
    )?;
    debug!("loaded persisted certificate authority");
    Ok(CertificateAuthority::new(certificate_pair))
}

pub struct CertificateRotator {
    store: SharedRecordStore,
    ca: Arc<CertificateAuthority<ecdsa::SigningKey>>,
    namespace: String,
    secret_name: String,
    dns_names: Vec<String>,
    validity: Duration,
}

impl CertificateRotator {
    pub fn new(
        store: SharedRecordStore,
        ca: Arc<CertificateAuthority<ecdsa::SigningKey>>,
        namespace: impl Into<String>,
        secret_name: impl Into<String>,
        dns_names: Vec<String>,
        validity: Duration,
    ) -> Self {
        Self {
            store,
            ca,
            namespace: namespace.into(),
            secret_name: secret_name.into(),
            dns_names,
            validity,
        }
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub async fn rotate(&self) -> Result<Rotation> {
        self.rotate_at(SystemTime::now()).await
    }

    /// Ensures the secret holds a certificate which is valid at `now`,
    /// carries the configured SANs and was issued by the current CA.
    #[instrument(
        name = "rotate_serving_certificate",
        skip(self),
        fields(secret.namespace = %self.namespace, secret.name = %self.secret_name),
    )]
    pub async fn rotate_at(&self, now: SystemTime) -> Result<Rotation> {
        let existing = match self.store.get_secret(&self.namespace, &self.secret_name).await {
            Ok(secret) => Some(secret),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                return Err(err).context(ReadSecretSnafu {
                    namespace: &self.namespace,
                    name: &self.secret_name,
                });
            }
        };

        let ca_pem = self.ca.ca_cert_pem().context(EncodeCertificateSnafu)?;
        let reason = match &existing {
            Some(secret) => match self.check(secret, &ca_pem, now) {
                Ok(certificate) => {
                    debug!("serving certificate is up to date");
                    return Ok(Rotation {
                        outcome: RotationOutcome::Unchanged,
                        certificate,
                    });
                }
                Err(reason) => reason,
            },
            None => ReissueReason::Missing,
        };

        info!(%reason, "issuing serving certificate");
        let certificate = self.issue().await?;
        let secret = self.secret(existing, &certificate, ca_pem)?;

        let written = match &secret.resource_version {
            Some(_) => self.store.update_secret(&secret).await,
            None => self.store.create_secret(&secret).await,
        };
        match written {
            Ok(_) => Ok(Rotation {
                outcome: RotationOutcome::Issued(reason),
                certificate,
            }),
            Err(err) if err.is_conflict() => {
                debug!("serving certificate secret was written concurrently");
                Ok(Rotation {
                    outcome: RotationOutcome::LostRace,
                    certificate: self.winner().await.unwrap_or(certificate),
                })
            }
            Err(err) => Err(err).context(WriteSecretSnafu {
                namespace: &self.namespace,
                name: &self.secret_name,
            }),
        }
    }

    /// Returns the persisted certificate if it can be served as is.
    fn check(
        &self,
        secret: &SecretRecord,
        ca_pem: &str,
        now: SystemTime,
    ) -> Result<CertificatePair<ecdsa::SigningKey>, ReissueReason> {
        let (Some(certificate_pem), Some(private_key_pem)) = (
            secret.data(SECRET_KEY_TLS_CERT),
            secret.data(SECRET_KEY_TLS_KEY),
        ) else {
            return Err(ReissueReason::Missing);
        };

        let certificate = CertificatePair::<ecdsa::SigningKey>::from_pem(
            certificate_pem,
            private_key_pem,
        )
        .map_err(|err| {
            warn!(
                error = &err as &dyn std::error::Error,
                "persisted serving certificate is unreadable"
            );
            ReissueReason::Unreadable
        })?;
        let info = CertificateInfo::from_certificate(certificate.certificate());

        if info.is_expired_at(now) {
            return Err(ReissueReason::Expired);
        }

        let expected: BTreeSet<&str> = self.dns_names.iter().map(String::as_str).collect();
        let actual: BTreeSet<&str> = info.dns_names.iter().map(String::as_str).collect();
        if expected != actual {
            return Err(ReissueReason::SubjectAlternativeNamesChanged);
        }

        if !info.is_issued_by(self.ca.ca_cert()) {
            return Err(ReissueReason::IssuerChanged);
        }

        if info.remaining_at(now) < info.validity() / REISSUE_REMAINING_FRACTION {
            return Err(ReissueReason::NearingExpiry);
        }

        if secret.data(SECRET_KEY_CA_CERT) != Some(ca_pem.as_bytes()) {
            return Err(ReissueReason::CaBundleChanged);
        }

        Ok(certificate)
    }

    async fn issue(&self) -> Result<CertificatePair<ecdsa::SigningKey>> {
        let ca = self.ca.clone();
        let dns_names = self.dns_names.clone();
        let validity = self.validity;

        // Key generation and signing can take a while
        tokio::task::spawn_blocking(move || {
            CertificatePair::<ecdsa::SigningKey>::builder()
                .subject(&format!("CN={SERVICE_NAME}"))
                .subject_alternative_dns_names(&dns_names)
                .validity(validity)
                .signed_by(ca.as_ref())
                .build()
                .context(IssueCertificateSnafu)
        })
        .await
        .context(TokioSpawnBlockingSnafu)?
    }

    fn secret(
        &self,
        existing: Option<SecretRecord>,
        certificate: &CertificatePair<ecdsa::SigningKey>,
        ca_pem: String,
    ) -> Result<SecretRecord> {
        let certificate_pem = certificate.certificate_pem().context(EncodeCertificateSnafu)?;
        let private_key_pem: Zeroizing<String> =
            certificate.private_key_pem().context(EncodeCertificateSnafu)?;

        let mut secret = existing.unwrap_or_else(|| SecretRecord {
            namespace: self.namespace.clone(),
            name: self.secret_name.clone(),
            ..Default::default()
        });
        secret.type_ = Some(SECRET_TYPE_TLS.to_owned());
        secret
            .data
            .insert(SECRET_KEY_TLS_CERT.to_owned(), certificate_pem.into_bytes());
        secret.data.insert(
            SECRET_KEY_TLS_KEY.to_owned(),
            private_key_pem.as_bytes().to_vec(),
        );
        secret
            .data
            .insert(SECRET_KEY_CA_CERT.to_owned(), ca_pem.into_bytes());

        Ok(secret)
    }

    /// Rotates every `interval` and hands each resulting certificate to the
    /// server. The first round is expected to have run at startup.
    pub async fn run(self, cert_resolver: Arc<CertificateResolver>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        // Let the interval tick once, so that the first loop iteration does
        // not start immediately.
        interval.tick().await;

        loop {
            interval.tick().await;

            let rotation = match self.rotate().await {
                Ok(rotation) => rotation,
                Err(err) => {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to rotate serving certificate"
                    );
                    continue;
                }
            };

            // Another replica may have rotated, so the persisted certificate
            // is always served.
            if let Err(err) = cert_resolver.update(&rotation.certificate) {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to serve rotated certificate"
                );
            }
        }
    }

    /// The certificate persisted by the writer which won a race.
    async fn winner(&self) -> Option<CertificatePair<ecdsa::SigningKey>> {
        let secret = self
            .store
            .get_secret(&self.namespace, &self.secret_name)
            .await
            .ok()?;

        CertificatePair::from_pem(
            secret.data(SECRET_KEY_TLS_CERT)?,
            secret.data(SECRET_KEY_TLS_KEY)?,
        )
        .ok()
    }
}
