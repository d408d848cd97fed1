//! Local validator keyring.
//!
//! Holds the ed25519 seeds of the validators this node may produce blocks
//! for. A validator selected as producer whose key is not in the keyring
//! cannot sign; the consensus engine treats that as a missed slot.
//!
//! Format (JSON):
//! { "v": 1, "seeds": ["..64 hex..", ...] }

use super::ed25519::Ed25519Keypair;
use super::{address_from_public_key, CryptoError, PublicKeyBytes, Signer};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fs, io, path::Path};

const V: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyringFile {
    v: u32,
    seeds: Vec<String>,
}

#[derive(Default, Clone)]
pub struct Keyring {
    keys: BTreeMap<Address, Ed25519Keypair>,
}

impl Keyring {
    /// Load from disk. A missing file yields an empty keyring.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(path)?;
        let f: KeyringFile = serde_json::from_str(&s)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("keyring parse: {e}")))?;
        if f.v != V {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unsupported keyring version {}", f.v)));
        }
        let mut ring = Self::default();
        for seed_hex in f.seeds {
            let bytes = hex::decode(seed_hex.trim_start_matches("0x"))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("keyring seed: {e}")))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "keyring seed must be 32 bytes"))?;
            ring.insert(Ed25519Keypair::from_seed(seed));
        }
        Ok(ring)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = KeyringFile {
            v: V,
            seeds: self.keys.values().map(|k| hex::encode(k.to_bytes())).collect(),
        };
        let s = serde_json::to_string_pretty(&out)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("keyring encode: {e}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, s)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp, path)
    }

    /// Add a key; returns the validator address it signs for.
    pub fn insert(&mut self, kp: Ed25519Keypair) -> Address {
        let addr = address_from_public_key(&kp.public_key());
        self.keys.insert(addr.clone(), kp);
        addr
    }

    pub fn signer_for(&self, validator: &Address) -> Result<&Ed25519Keypair, CryptoError> {
        self.keys
            .get(validator)
            .ok_or_else(|| CryptoError::KeyUnavailable(validator.to_string()))
    }

    pub fn public_keys(&self) -> impl Iterator<Item = PublicKeyBytes> + '_ {
        self.keys.values().map(|k| k.public_key())
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.keys.keys()
    }

    pub fn len(&self) -> usize { self.keys.len() }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let mut ring = Keyring::default();
        let addr = ring.insert(Ed25519Keypair::from_seed([3u8; 32]));
        ring.save(&path).unwrap();

        let back = Keyring::load(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.signer_for(&addr).is_ok());
        assert!(matches!(
            back.signer_for(&Address::zero()),
            Err(CryptoError::KeyUnavailable(_))
        ));
    }
}
