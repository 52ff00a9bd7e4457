//! NIST P-256 keys.
use p256::{NistP256, pkcs8::DecodePrivateKey};
use rand_core::{CryptoRngCore, OsRng};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode P-256 private key from PKCS#8 PEM"))]
    DecodePrivateKey { source: p256::pkcs8::Error },
}

#[derive(Debug)]
pub struct SigningKey(p256::ecdsa::SigningKey);

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = ecdsa::der::Signature<NistP256>;
    type SigningKey = p256::ecdsa::SigningKey;
    type VerifyingKey = p256::ecdsa::VerifyingKey;

    fn new() -> Result<Self> {
        Self::new_with_rng(&mut OsRng)
    }

    #[instrument(name = "generate_p256_key", skip_all)]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore + Sized,
    {
        Ok(Self(p256::ecdsa::SigningKey::random(rng)))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        *self.0.verifying_key()
    }

    #[instrument(name = "decode_p256_key", skip(input))]
    fn from_pkcs8_pem(input: &str) -> Result<Self> {
        p256::ecdsa::SigningKey::from_pkcs8_pem(input)
            .map(Self)
            .context(DecodePrivateKeySnafu)
    }

    fn algorithm_name() -> &'static str {
        "ecdsa"
    }

    fn key_size() -> usize {
        256
    }
}
