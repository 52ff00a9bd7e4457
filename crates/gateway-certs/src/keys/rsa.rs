//! RSA keys signing with PKCS#1 v1.5 and SHA-256.
//!
//! Provisioned CAs are frequently RSA based. Generating a key of
//! [`KEY_SIZE`] bits can take several seconds.
use rand_core::{CryptoRngCore, OsRng};
use rsa::{RsaPrivateKey, pkcs8::DecodePrivateKey};
use signature::Keypair;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

#[cfg(not(test))]
const KEY_SIZE: usize = 3072;

#[cfg(test)]
const KEY_SIZE: usize = 1024;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate {KEY_SIZE} bit RSA key"))]
    GenerateKey { source: rsa::Error },

    #[snafu(display("failed to decode RSA private key from PKCS#8 PEM"))]
    DecodePrivateKey { source: rsa::pkcs8::Error },
}

#[derive(Debug)]
pub struct SigningKey(rsa::pkcs1v15::SigningKey<sha2::Sha256>);

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = rsa::pkcs1v15::Signature;
    type SigningKey = rsa::pkcs1v15::SigningKey<sha2::Sha256>;
    type VerifyingKey = rsa::pkcs1v15::VerifyingKey<sha2::Sha256>;

    fn new() -> Result<Self> {
        Self::new_with_rng(&mut OsRng)
    }

    #[instrument(name = "generate_rsa_key", skip_all, fields(key.size = KEY_SIZE))]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore + Sized,
    {
        RsaPrivateKey::new(rng, KEY_SIZE)
            .map(|private_key| Self(rsa::pkcs1v15::SigningKey::new(private_key)))
            .context(GenerateKeySnafu)
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        self.0.verifying_key()
    }

    #[instrument(name = "decode_rsa_key", skip(input))]
    fn from_pkcs8_pem(input: &str) -> Result<Self> {
        RsaPrivateKey::from_pkcs8_pem(input)
            .map(|private_key| Self(rsa::pkcs1v15::SigningKey::new(private_key)))
            .context(DecodePrivateKeySnafu)
    }

    fn algorithm_name() -> &'static str {
        "rsa"
    }

    fn key_size() -> usize {
        KEY_SIZE
    }
}
