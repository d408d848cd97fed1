use super::envelope::{DecodeError, Envelope};
use crate::types::{keccak256, Address, TxType};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid recovery value v={0}")]
    BadV(u64),
    #[error("malformed signature scalars")]
    BadSignature,
    #[error("public key not recoverable from signature")]
    Unrecoverable,
}

/// Derives the sender address of a signed envelope.
pub trait AddressRecovery: Send + Sync {
    fn recover_address(&self, raw: &[u8]) -> Result<Address, RecoveryError>;
}

/// secp256k1 public-key recovery + keccak-256 address derivation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Secp256k1Recovery;

impl AddressRecovery for Secp256k1Recovery {
    fn recover_address(&self, raw: &[u8]) -> Result<Address, RecoveryError> {
        recover_envelope(&Envelope::decode(raw)?)
    }
}

fn recovery_id(env: &Envelope) -> Result<u8, RecoveryError> {
    match env.tx_type {
        TxType::Legacy => match env.v {
            27 | 28 => Ok((env.v - 27) as u8),
            v if v >= 35 => Ok(((v - 35) % 2) as u8),
            v => Err(RecoveryError::BadV(v)),
        },
        TxType::AccessList | TxType::FeeMarket => match env.v {
            0 | 1 => Ok(env.v as u8),
            v => Err(RecoveryError::BadV(v)),
        },
    }
}

pub fn recover_envelope(env: &Envelope) -> Result<Address, RecoveryError> {
    let recid = RecoveryId::from_byte(recovery_id(env)?).ok_or(RecoveryError::BadSignature)?;
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&env.r);
    rs[32..].copy_from_slice(&env.s);
    let sig = Signature::from_slice(&rs).map_err(|_| RecoveryError::BadSignature)?;

    let vk = VerifyingKey::recover_from_prehash(&env.signing_hash(), &sig, recid)
        .map_err(|_| RecoveryError::Unrecoverable)?;
    let point = vk.to_encoded_point(false);
    // 0x04 || X || Y
    let h = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h[12..]);
    Ok(Address::from_bytes(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::rlp::RlpStream;
    use k256::ecdsa::SigningKey;

    fn address_of(sk: &SigningKey) -> Address {
        let point = sk.verifying_key().to_encoded_point(false);
        let h = keccak256(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&h[12..]);
        Address::from_bytes(out)
    }

    fn signed_legacy(sk: &SigningKey, chain_id: u64) -> Vec<u8> {
        let fields = |s: &mut RlpStream| {
            s.append(&3u64);
            s.append(&1_000u64);
            s.append(&21_000u64);
            s.append(&[0x55u8; 20].as_slice());
            s.append(&42u64);
            s.append(&"");
        };
        let mut pre = RlpStream::new_list(9);
        fields(&mut pre);
        pre.append(&chain_id);
        pre.append(&0u8);
        pre.append(&0u8);
        let hash = keccak256(&pre.out());
        let (sig, recid) = sk.sign_prehash_recoverable(&hash).unwrap();
        let bytes = sig.to_bytes();

        let mut s = RlpStream::new_list(9);
        fields(&mut s);
        s.append(&(chain_id * 2 + 35 + recid.to_byte() as u64));
        s.append(&bytes[..32].to_vec());
        s.append(&bytes[32..].to_vec());
        s.out().to_vec()
    }

    #[test]
    fn recovers_eip155_sender() {
        let sk = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let raw = signed_legacy(&sk, 1337);
        assert_eq!(Secp256k1Recovery.recover_address(&raw).unwrap(), address_of(&sk));
    }

    #[test]
    fn tampered_payload_recovers_someone_else() {
        let sk = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let mut raw = signed_legacy(&sk, 1);
        // two-byte list header, then the nonce byte
        raw[2] ^= 0x07;
        match Secp256k1Recovery.recover_address(&raw) {
            Ok(addr) => assert_ne!(addr, address_of(&sk)),
            Err(e) => assert!(matches!(e, RecoveryError::Unrecoverable | RecoveryError::Decode(_))),
        }
    }

    #[test]
    fn rejects_bad_v() {
        let sk = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let mut env = Envelope::decode(&signed_legacy(&sk, 1)).unwrap();
        env.v = 30;
        assert_eq!(recover_envelope(&env), Err(RecoveryError::BadV(30)));
    }
}
