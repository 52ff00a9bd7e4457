//! Key pairs which sign certificate authorities and are bound to leaf
//! certificates.
//!
//! The gateway generates NIST P-256 keys ([`ecdsa`]). [`rsa`] keys are
//! supported for CAs provisioned elsewhere. The [`CertificateKeypair`] trait
//! keeps the certificate code independent of the concrete algorithm.
use std::fmt::Debug;

use p256::pkcs8::EncodePrivateKey;
use rand_core::CryptoRngCore;
use signature::{Keypair, Signer};
use x509_cert::{
    der::Decode,
    spki::{
        EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding,
        SubjectPublicKeyInfoOwned,
    },
};

pub mod ecdsa;
pub mod rsa;

pub trait CertificateKeypair
where
    <Self::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
    Self: Debug + Sized,
{
    type SigningKey: SignatureAlgorithmIdentifier
        + Keypair
        + Signer<Self::Signature>
        + EncodePrivateKey;
    type Signature: SignatureBitStringEncoding;
    type VerifyingKey: EncodePublicKey;

    type Error: std::error::Error + 'static;

    /// Generates a key from the operating system's CSPRNG.
    fn new() -> Result<Self, Self::Error>;

    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self, Self::Error>
    where
        Rng: CryptoRngCore + Sized;

    fn signing_key(&self) -> &Self::SigningKey;

    fn verifying_key(&self) -> Self::VerifyingKey;

    /// Reads a PKCS#8 PEM document.
    fn from_pkcs8_pem(input: &str) -> Result<Self, Self::Error>;

    fn algorithm_name() -> &'static str;

    fn key_size() -> usize;
}

/// The public half of `key_pair` as it is embedded into certificates.
pub(crate) fn subject_public_key_info<KP>(
    key_pair: &KP,
) -> Result<SubjectPublicKeyInfoOwned, x509_cert::spki::Error>
where
    KP: CertificateKeypair,
    <KP::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
{
    let document = key_pair.verifying_key().to_public_key_der()?;
    Ok(SubjectPublicKeyInfoOwned::from_der(document.as_bytes())?)
}
