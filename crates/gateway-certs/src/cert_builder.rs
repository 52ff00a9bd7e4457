//! Leaf certificates signed by a [`CertificateAuthority`].
use std::{
    net::IpAddr,
    time::{Duration, SystemTime},
};

use bon::Builder;
use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, Profile},
    der::asn1::Ia5String,
    ext::pkix::{ExtendedKeyUsage, SubjectAltName, name::GeneralName},
    name::Name,
    serial_number::SerialNumber,
    spki::EncodePublicKey,
    time::Validity,
};

use crate::{
    CertificatePair,
    ca::{CertificateAuthority, DEFAULT_CERTIFICATE_VALIDITY},
    keys::{CertificateKeypair, subject_public_key_info},
};

#[derive(Debug, Snafu)]
pub enum CreateCertificateError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("invalid certificate validity of {validity:?}"))]
    InvalidValidity {
        source: x509_cert::der::Error,
        validity: Duration,
    },

    #[snafu(display("failed to parse {subject:?} as certificate subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("{dns_name:?} is not a valid DNS subject alternative name"))]
    InvalidDnsName {
        source: x509_cert::der::Error,
        dns_name: String,
    },

    #[snafu(display(
        "a certificate for {subject:?} valid until {not_after:?} would outlive its CA (valid until {ca_not_after:?})"
    ))]
    OutlivesCa {
        subject: String,
        not_after: SystemTime,
        ca_not_after: SystemTime,
    },

    #[snafu(display("failed to generate key pair"))]
    GenerateKeyPair { source: E },

    #[snafu(display("failed to encode public key"))]
    EncodePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to sign certificate"))]
    SignCertificate { source: x509_cert::builder::Error },
}

/// Issues a leaf certificate usable for TLS server and client
/// authentication.
///
/// ```no_run
/// use gateway_certs::{CertificatePair, ca::CertificateAuthority, keys::ecdsa};
///
/// let ca = CertificateAuthority::<ecdsa::SigningKey>::builder().build().unwrap();
/// let sans = vec!["cluster-gateway.open-cluster-management.svc".to_owned()];
/// let serving = CertificatePair::builder()
///     .subject("CN=cluster-gateway")
///     .subject_alternative_dns_names(&sans)
///     .signed_by(&ca)
///     .build()
///     .unwrap();
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateBuilder<'a, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    subject: &'a str,

    #[builder(default)]
    subject_alternative_dns_names: &'a [String],

    #[builder(default)]
    subject_alternative_ip_addresses: &'a [IpAddr],

    #[builder(default = DEFAULT_CERTIFICATE_VALIDITY)]
    validity: Duration,

    /// A fresh key is generated when none is given.
    key_pair: Option<KP>,

    signed_by: &'a CertificateAuthority<KP>,
}

impl<KP, S> CertificateBuilderBuilder<'_, KP, S>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_builder_builder::IsComplete,
{
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        self.finish_builder().build()
    }
}

impl<KP> CertificateBuilder<'_, KP>
where
    KP: CertificateKeypair,
    <KP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(name = "issue_certificate", skip(self), fields(subject = self.subject))]
    pub fn build(self) -> Result<CertificatePair<KP>, CreateCertificateError<KP::Error>> {
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let validity = Validity::from_now(self.validity).context(InvalidValiditySnafu {
            validity: self.validity,
        })?;

        let not_after = validity.not_after.to_system_time();
        let ca_not_after = self
            .signed_by
            .ca_cert()
            .tbs_certificate
            .validity
            .not_after
            .to_system_time();
        ensure!(
            not_after < ca_not_after,
            OutlivesCaSnafu {
                subject: self.subject,
                not_after,
                ca_not_after,
            }
        );

        let subject_alt_name = self.subject_alt_name()?;
        let key_pair = self
            .key_pair
            .map_or_else(KP::new, Ok)
            .context(GenerateKeyPairSnafu)?;
        let spki = subject_public_key_info(&key_pair).context(EncodePublicKeySnafu)?;

        let serial_number = SerialNumber::from(rand::random::<u64>());
        debug!(
            certificate.subject = %subject,
            certificate.serial = ?serial_number,
            certificate.not_after = %validity.not_after,
            certificate.san.dns_names = ?self.subject_alternative_dns_names,
            certificate.san.ip_addresses = ?self.subject_alternative_ip_addresses,
            certificate.issuer = %self.signed_by.issuer_name(),
            "signing leaf certificate"
        );

        let mut builder = x509_cert::builder::CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.signed_by.issuer_name().clone(),
                enable_key_agreement: false,
                enable_key_encipherment: true,
            },
            serial_number,
            validity,
            subject,
            spki,
            self.signed_by.signing_key(),
        )
        .context(SignCertificateSnafu)?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![
                ID_KP_SERVER_AUTH,
                ID_KP_CLIENT_AUTH,
            ]))
            .context(SignCertificateSnafu)?;
        if let Some(subject_alt_name) = subject_alt_name {
            builder
                .add_extension(&subject_alt_name)
                .context(SignCertificateSnafu)?;
        }
        let certificate = builder.build().context(SignCertificateSnafu)?;

        Ok(CertificatePair::new(certificate, key_pair))
    }

    /// [`None`] when neither DNS names nor IP addresses were requested.
    fn subject_alt_name(&self) -> Result<Option<SubjectAltName>, CreateCertificateError<KP::Error>> {
        let mut names = Vec::with_capacity(
            self.subject_alternative_dns_names.len() + self.subject_alternative_ip_addresses.len(),
        );
        for dns_name in self.subject_alternative_dns_names {
            let dns_name = Ia5String::new(dns_name).context(InvalidDnsNameSnafu { dns_name })?;
            names.push(GeneralName::DnsName(dns_name));
        }
        names.extend(
            self.subject_alternative_ip_addresses
                .iter()
                .copied()
                .map(GeneralName::from),
        );

        Ok((!names.is_empty()).then_some(SubjectAltName(names)))
    }
}
