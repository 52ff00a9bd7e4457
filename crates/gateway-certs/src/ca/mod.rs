//! Certificate authorities (CAs) which sign the gateway's serving
//! certificates.
use std::{fmt::Debug, path::Path};

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{Certificate, name::RdnSequence, spki::EncodePublicKey};

use crate::{CertificatePair, CertificatePairError, keys::CertificateKeypair};

mod ca_builder;
mod consts;
pub use ca_builder::*;
pub use consts::*;

#[derive(Debug, Snafu)]
pub enum LoadCertificateAuthorityError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to read CA certificate from {path:?}"))]
    ReadCertificateFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to read CA private key from {path:?}"))]
    ReadPrivateKeyFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to decode CA certificate pair"))]
    DecodeCertificatePair { source: CertificatePairError<E> },
}

/// A CA holding its own certificate and the key used to sign leaf
/// certificates.
#[derive(Debug)]
pub struct CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate_pair: CertificatePair<SK>,
}

impl<SK> CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn new(certificate_pair: CertificatePair<SK>) -> Self {
        Self { certificate_pair }
    }

    pub fn builder() -> CertificateAuthorityBuilderBuilder<'static, SK> {
        CertificateAuthorityBuilder::start_builder()
    }

    /// Loads a provisioned CA from PEM-encoded certificate and PKCS#8 key
    /// files.
    #[instrument(name = "load_certificate_authority_from_files", skip_all)]
    pub fn from_files(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
    ) -> Result<Self, LoadCertificateAuthorityError<SK::Error>> {
        let certificate_path = certificate_path.as_ref();
        let private_key_path = private_key_path.as_ref();

        let certificate_pem =
            std::fs::read(certificate_path).context(ReadCertificateFileSnafu {
                path: certificate_path,
            })?;
        let private_key_pem =
            zeroize::Zeroizing::new(std::fs::read(private_key_path).context(
                ReadPrivateKeyFileSnafu {
                    path: private_key_path,
                },
            )?);

        let certificate_pair = CertificatePair::from_pem(&certificate_pem, &private_key_pem)
            .context(DecodeCertificatePairSnafu)?;

        debug!(
            ca.subject = %certificate_pair.certificate().tbs_certificate.subject,
            ca.path = %certificate_path.display(),
            "loaded certificate authority"
        );

        Ok(Self { certificate_pair })
    }

    pub fn certificate_pair(&self) -> &CertificatePair<SK> {
        &self.certificate_pair
    }

    pub fn signing_key(&self) -> &SK::SigningKey {
        self.certificate_pair.key_pair().signing_key()
    }

    pub fn ca_cert(&self) -> &Certificate {
        self.certificate_pair.certificate()
    }

    pub fn ca_cert_pem(&self) -> Result<String, CertificatePairError<SK::Error>> {
        self.certificate_pair.certificate_pem()
    }

    /// The name leaf certificates carry as their issuer.
    pub fn issuer_name(&self) -> &RdnSequence {
        &self.ca_cert().tbs_certificate.subject
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::keys::ecdsa;

    #[test]
    fn load_from_files() {
        let ca = CertificateAuthority::<ecdsa::SigningKey>::builder()
            .build()
            .expect("failed to build CA");

        let mut cert_file = tempfile_with(ca.ca_cert_pem().unwrap().as_bytes());
        let mut key_file = tempfile_with(
            ca.certificate_pair
                .private_key_pem()
                .unwrap()
                .as_bytes(),
        );
        cert_file.flush().unwrap();
        key_file.flush().unwrap();

        let loaded =
            CertificateAuthority::<ecdsa::SigningKey>::from_files(cert_file.path(), key_file.path())
                .expect("failed to load CA");

        assert_eq!(loaded.ca_cert(), ca.ca_cert());
    }

    #[test]
    fn load_from_missing_file() {
        let err = CertificateAuthority::<ecdsa::SigningKey>::from_files(
            "/does/not/exist.crt",
            "/does/not/exist.key",
        )
        .unwrap_err();

        assert!(matches!(
            err,
            LoadCertificateAuthorityError::ReadCertificateFile { .. }
        ));
    }

    fn tempfile_with(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }
}
