//! Read-only inspection of existing certificates, used to decide whether a
//! persisted certificate still fits its purpose.
use std::time::{Duration, SystemTime};

use const_oid::db::rfc5280::{ID_CE_AUTHORITY_KEY_IDENTIFIER, ID_CE_SUBJECT_ALT_NAME};
use snafu::{OptionExt, ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::{Decode, referenced::OwnedToRef},
    ext::pkix::{AuthorityKeyIdentifier, SubjectAltName, name::GeneralName},
    name::Name,
};

#[derive(Debug, Snafu)]
pub enum InspectError {
    #[snafu(display("failed to decode PEM certificate chain"))]
    DecodeChain { source: x509_cert::der::Error },

    #[snafu(display("the PEM document does not contain any certificate"))]
    EmptyChain,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: Name,
    pub issuer: Name,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub dns_names: Vec<String>,
    pub authority_key_id: Option<Vec<u8>>,
}

impl CertificateInfo {
    /// Inspects the first certificate of a PEM chain.
    pub fn from_pem(pem: &[u8]) -> Result<Self, InspectError> {
        let certificate = Certificate::load_pem_chain(pem)
            .context(DecodeChainSnafu)?
            .into_iter()
            .next()
            .context(EmptyChainSnafu)?;

        Ok(Self::from_certificate(&certificate))
    }

    pub fn from_certificate(certificate: &Certificate) -> Self {
        let tbs = &certificate.tbs_certificate;
        let extensions = tbs.extensions.as_deref().unwrap_or_default();

        let dns_names = extensions
            .iter()
            .filter(|ext| ext.extn_id == ID_CE_SUBJECT_ALT_NAME)
            .filter_map(|ext| SubjectAltName::from_der(ext.extn_value.as_bytes()).ok())
            .flat_map(|san| san.0)
            .filter_map(|name| match name {
                GeneralName::DnsName(dns_name) => Some(dns_name.as_str().to_owned()),
                _ => None,
            })
            .collect();

        let authority_key_id = extensions
            .iter()
            .find(|ext| ext.extn_id == ID_CE_AUTHORITY_KEY_IDENTIFIER)
            .and_then(|ext| AuthorityKeyIdentifier::from_der(ext.extn_value.as_bytes()).ok())
            .and_then(|aki| aki.key_identifier)
            .map(|id| id.as_bytes().to_vec());

        Self {
            subject: tbs.subject.clone(),
            issuer: tbs.issuer.clone(),
            not_before: tbs.validity.not_before.to_system_time(),
            not_after: tbs.validity.not_after.to_system_time(),
            dns_names,
            authority_key_id,
        }
    }

    /// Length of the validity window.
    pub fn validity(&self) -> Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.not_after
    }

    /// Time left until `notAfter`, zero once expired.
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.not_after.duration_since(now).unwrap_or_default()
    }

    /// Whether this certificate was signed by the key of `ca`, judged by the
    /// authority key identifier.
    pub fn is_issued_by(&self, ca: &Certificate) -> bool {
        let Some(authority_key_id) = &self.authority_key_id else {
            return self.issuer == ca.tbs_certificate.subject;
        };

        AuthorityKeyIdentifier::try_from(
            ca.tbs_certificate
                .subject_public_key_info
                .owned_to_ref(),
        )
        .ok()
        .and_then(|aki| aki.key_identifier)
        .is_some_and(|ca_key_id| ca_key_id.as_bytes() == authority_key_id.as_slice())
    }
}
