use std::time::Duration;

use bon::Builder;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::referenced::OwnedToRef,
    ext::pkix::AuthorityKeyIdentifier,
    name::Name,
    serial_number::SerialNumber,
    spki::EncodePublicKey,
    time::Validity,
};

use super::CertificateAuthority;
use crate::{
    CertificatePair,
    ca::{DEFAULT_CA_VALIDITY, GATEWAY_ROOT_CA_SUBJECT},
    keys::{CertificateKeypair, subject_public_key_info},
};

#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("invalid CA validity of {validity:?}"))]
    InvalidValidity {
        source: x509_cert::der::Error,
        validity: Duration,
    },

    #[snafu(display("failed to parse {subject:?} as CA subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to generate CA key pair"))]
    GenerateKeyPair { source: E },

    #[snafu(display("failed to encode CA public key"))]
    EncodePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to derive authority key identifier"))]
    DeriveAuthorityKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to sign CA certificate"))]
    SignCertificate { source: x509_cert::builder::Error },
}

/// Creates a self-signed root [`CertificateAuthority`]. Every field is
/// optional: a CA generated at gateway startup uses
/// [`GATEWAY_ROOT_CA_SUBJECT`], [`DEFAULT_CA_VALIDITY`] and a fresh key.
///
/// ```no_run
/// use gateway_certs::{ca::CertificateAuthority, keys::ecdsa};
///
/// let ca = CertificateAuthority::<ecdsa::SigningKey>::builder()
///     .build()
///     .expect("failed to build CA");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[builder(default = GATEWAY_ROOT_CA_SUBJECT)]
    subject: &'a str,

    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    signing_key_pair: Option<SKP>,
}

impl<SKP, S> CertificateAuthorityBuilderBuilder<'_, SKP, S>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_authority_builder_builder::IsComplete,
{
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateAuthorityBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(name = "create_certificate_authority", skip(self), fields(subject = self.subject))]
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let validity = Validity::from_now(self.validity).context(InvalidValiditySnafu {
            validity: self.validity,
        })?;
        let key_pair = self
            .signing_key_pair
            .map_or_else(SKP::new, Ok)
            .context(GenerateKeyPairSnafu)?;
        let spki = subject_public_key_info(&key_pair).context(EncodePublicKeySnafu)?;

        // A root CA is its own authority, so the identifier is derived from
        // its own public key (RFC 5280 section 4.2.1.1).
        let authority_key_id = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveAuthorityKeyIdentifierSnafu)?;

        let serial_number = SerialNumber::from(rand::random::<u64>());
        debug!(
            ca.subject = %subject,
            ca.serial = ?serial_number,
            ca.not_after = %validity.not_after,
            ca.public_key.algorithm = SKP::algorithm_name(),
            "signing root certificate"
        );

        let mut builder = CertificateBuilder::new(
            Profile::Root,
            serial_number,
            validity,
            subject,
            spki,
            key_pair.signing_key(),
        )
        .context(SignCertificateSnafu)?;
        builder
            .add_extension(&authority_key_id)
            .context(SignCertificateSnafu)?;
        let certificate = builder.build().context(SignCertificateSnafu)?;

        Ok(CertificateAuthority::new(CertificatePair::new(
            certificate,
            key_pair,
        )))
    }
}
