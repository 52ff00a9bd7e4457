use std::sync::Arc;

use arc_swap::ArcSwap;
use gateway_certs::{CertificatePair, CertificatePairError, keys::ecdsa};
use snafu::{ResultExt, Snafu};
use tokio_rustls::rustls::{
    crypto::ring::default_provider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

type Result<T, E = CertificateResolverError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CertificateResolverError {
    #[snafu(display("failed to encode serving certificate as DER"))]
    EncodeCertificateDer {
        source: CertificatePairError<ecdsa::Error>,
    },

    #[snafu(display("failed to encode private key as DER"))]
    EncodePrivateKeyDer {
        source: CertificatePairError<ecdsa::Error>,
    },

    #[snafu(display("failed to decode CertifiedKey from DER"))]
    DecodeCertifiedKeyFromDer { source: tokio_rustls::rustls::Error },
}

/// Hands out the current serving certificate for every TLS handshake.
///
/// The certificate is swapped in place by [`Self::update`] whenever the
/// rotation produced a new one, so established listeners never restart.
#[derive(Debug)]
pub struct CertificateResolver {
    /// Using a [`ArcSwap`] so that handshakes never wait on a rotation.
    current_certified_key: ArcSwap<CertifiedKey>,
}

impl CertificateResolver {
    pub fn new(certificate: &CertificatePair<ecdsa::SigningKey>) -> Result<Self> {
        Ok(Self {
            current_certified_key: ArcSwap::new(certified_key(certificate)?),
        })
    }

    pub fn update(&self, certificate: &CertificatePair<ecdsa::SigningKey>) -> Result<()> {
        self.current_certified_key
            .store(certified_key(certificate)?);
        Ok(())
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current_certified_key.load_full()
    }
}

fn certified_key(certificate: &CertificatePair<ecdsa::SigningKey>) -> Result<Arc<CertifiedKey>> {
    let tls_provider = default_provider();

    let certificate_der = certificate
        .certificate_der()
        .context(EncodeCertificateDerSnafu)?;
    let private_key_der = certificate
        .private_key_der()
        .context(EncodePrivateKeyDerSnafu)?;
    let certified_key =
        CertifiedKey::from_der(vec![certificate_der], private_key_der, &tls_provider)
            .context(DecodeCertifiedKeyFromDerSnafu)?;

    Ok(Arc::new(certified_key))
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current_certified_key.load_full())
    }
}

#[cfg(test)]
mod tests {
    use gateway_certs::ca::CertificateAuthority;

    use super::*;

    fn certificate(
        ca: &CertificateAuthority<ecdsa::SigningKey>,
    ) -> CertificatePair<ecdsa::SigningKey> {
        CertificatePair::builder()
            .subject("CN=cluster-gateway")
            .signed_by(ca)
            .build()
            .unwrap()
    }

    #[test]
    fn update_swaps_the_served_certificate() {
        let ca = CertificateAuthority::<ecdsa::SigningKey>::builder()
            .build()
            .unwrap();
        let first = certificate(&ca);
        let second = certificate(&ca);

        let resolver = CertificateResolver::new(&first).unwrap();
        assert_eq!(resolver.current().cert[0], first.certificate_der().unwrap());

        resolver.update(&second).unwrap();
        assert_eq!(resolver.current().cert[0], second.certificate_der().unwrap());
    }
}
