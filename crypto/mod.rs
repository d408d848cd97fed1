use crate::types::{keccak256, Address};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("key error: {0}")]
    Key(String),
    #[error("signing key unavailable for {0}")]
    KeyUnavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PublicKeyBytes(#[serde(with = "crate::types::hex_bytes")] pub Vec<u8>);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureBytes(pub Vec<u8>);

pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKeyBytes;
    fn sign(&self, msg: &[u8]) -> Result<SignatureBytes, CryptoError>;
}

pub trait Verifier: Send + Sync {
    fn verify(pk: &PublicKeyBytes, msg: &[u8], sig: &SignatureBytes) -> Result<(), CryptoError>;
}

/// Validator address: last 20 bytes of keccak-256 over the public key.
pub fn address_from_public_key(pk: &PublicKeyBytes) -> Address {
    let h = keccak256(&pk.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h[12..]);
    Address::from_bytes(out)
}

pub mod ed25519;

pub mod keyring;
