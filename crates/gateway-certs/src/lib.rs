//! Types and functions to work with the X.509 material of the cluster gateway.
//!
//! The gateway holds a certificate authority (either provisioned from PEM
//! files or generated at startup) and uses it to sign its own short-lived
//! serving certificate. This crate covers key generation, CA creation, leaf
//! certificate signing, PEM encoding/decoding and inspection of existing
//! certificates, plus conversion into the DER types [`tokio_rustls`] expects.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
use p256::pkcs8::EncodePrivateKey;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_cert::{
    Certificate,
    der::{Encode, EncodePem},
    spki::EncodePublicKey,
};
use zeroize::Zeroizing;

use crate::{
    ca::PEM_LINE_ENDING,
    cert_builder::{CertificateBuilder, CertificateBuilderBuilder},
    keys::CertificateKeypair,
};

pub mod ca;
pub mod cert_builder;
pub mod inspect;
pub mod keys;

#[derive(Debug, Snafu)]
pub enum CertificatePairError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to serialize certificate as {key_encoding}"))]
    SerializeCertificate {
        source: x509_cert::der::Error,
        key_encoding: KeyEncoding,
    },

    #[snafu(display("failed to deserialize certificate from {key_encoding}"))]
    DeserializeCertificate {
        source: x509_cert::der::Error,
        key_encoding: KeyEncoding,
    },

    #[snafu(display("failed to serialize private key as PKCS8 {key_encoding}"))]
    SerializePrivateKey {
        source: p256::pkcs8::Error,
        key_encoding: KeyEncoding,
    },

    #[snafu(display("the PEM document does not contain any certificate"))]
    EmptyCertificateChain,

    #[snafu(display("private key is not valid UTF-8 PEM"))]
    PrivateKeyNotUtf8 { source: std::str::Utf8Error },

    #[snafu(display("failed to deserialize private key from PKCS8 {key_encoding}"))]
    DeserializePrivateKey { source: E, key_encoding: KeyEncoding },
}

/// A certificate together with the key pair it was issued for.
#[derive(Debug)]
pub struct CertificatePair<KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate: Certificate,
    key_pair: KP,
}

impl<KP> CertificatePair<KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn new(certificate: Certificate, key_pair: KP) -> Self {
        Self {
            certificate,
            key_pair,
        }
    }

    pub fn builder<'a>() -> CertificateBuilderBuilder<'a, KP> {
        CertificateBuilder::start_builder()
    }

    /// Reads the first certificate of a PEM chain and a PKCS#8 PEM key.
    pub fn from_pem(
        certificate_pem: &[u8],
        private_key_pem: &[u8],
    ) -> Result<Self, CertificatePairError<KP::Error>> {
        let certificate = Certificate::load_pem_chain(certificate_pem)
            .context(DeserializeCertificateSnafu {
                key_encoding: KeyEncoding::Pem,
            })?
            .into_iter()
            .next()
            .context(EmptyCertificateChainSnafu)?;

        let private_key_pem =
            std::str::from_utf8(private_key_pem).context(PrivateKeyNotUtf8Snafu)?;
        let key_pair =
            KP::from_pkcs8_pem(private_key_pem).context(DeserializePrivateKeySnafu {
                key_encoding: KeyEncoding::Pem,
            })?;

        Ok(Self {
            certificate,
            key_pair,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key_pair(&self) -> &KP {
        &self.key_pair
    }

    pub fn certificate_pem(&self) -> Result<String, CertificatePairError<KP::Error>> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }

    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CertificatePairError<KP::Error>> {
        self.key_pair
            .signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }

    pub fn certificate_der(
        &self,
    ) -> Result<CertificateDer<'static>, CertificatePairError<KP::Error>> {
        let der = self.certificate.to_der().context(SerializeCertificateSnafu {
            key_encoding: KeyEncoding::Der,
        })?;

        Ok(CertificateDer::from(der))
    }

    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, CertificatePairError<KP::Error>> {
        let document = self
            .key_pair
            .signing_key()
            .to_pkcs8_der()
            .context(SerializePrivateKeySnafu {
                key_encoding: KeyEncoding::Der,
            })?;

        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            document.as_bytes().to_vec(),
        )))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    Pem,
    Der,
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem => write!(f, "PEM"),
            Self::Der => write!(f, "DER"),
        }
    }
}
