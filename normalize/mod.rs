//! Raw signed envelope -> canonical `Transaction`.
//!
//! Pure and deterministic: the same raw bytes, hint and admission time always
//! produce the same record. No storage access.

pub mod bigint;
pub mod envelope;
pub mod recover;
pub mod rlp;

pub use envelope::{DecodeError, Envelope};
pub use recover::{AddressRecovery, RecoveryError, Secp256k1Recovery};

use crate::types::{keccak256, Address, Amount, Hash32, Transaction, TxStatus, UnixTime};
use bigint::{parse_hex, wei_to_amount, ValueError};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fields a submitter may have parsed already. The sender and an empty
/// recipient are taken from the hint; every other hint field must agree with
/// the envelope or the record is rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsedHint {
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<String>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("claimed hash {claimed} does not match computed {computed}")]
    HashMismatch { claimed: Hash32, computed: Hash32 },
    #[error("sender recovery: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("zero address rejected")]
    ZeroAddressRejected,
    #[error("value: {0}")]
    Value(#[from] ValueError),
    #[error("effective gas price {0} wei does not fit in 128 bits")]
    GasPriceOverflow(String),
    #[error("hint {field} {hint} disagrees with envelope {envelope}")]
    HintMismatch { field: &'static str, hint: String, envelope: String },
}

impl NormalizeError {
    /// Short stable label used to bucket failures in batch reports.
    pub fn label(&self) -> &'static str {
        match self {
            NormalizeError::Decode(_) => "decode",
            NormalizeError::HashMismatch { .. } => "hash_mismatch",
            NormalizeError::Recovery(_) => "recovery",
            NormalizeError::InvalidAddress(_) => "invalid_address",
            NormalizeError::ZeroAddressRejected => "zero_address",
            NormalizeError::Value(_) | NormalizeError::GasPriceOverflow(_) => "value_range",
            NormalizeError::HintMismatch { .. } => "hint_mismatch",
        }
    }
}

pub struct Normalizer<R: AddressRecovery = Secp256k1Recovery> {
    fee_floor: Amount,
    base_fee: BigUint,
    recovery: R,
}

impl Normalizer<Secp256k1Recovery> {
    pub fn new(fee_floor: Amount) -> Self {
        Self::with_recovery(fee_floor, Secp256k1Recovery)
    }
}

impl<R: AddressRecovery> Normalizer<R> {
    pub fn with_recovery(fee_floor: Amount, recovery: R) -> Self {
        Self { fee_floor, base_fee: BigUint::default(), recovery }
    }

    /// Base fee (wei) used for fee-market envelopes; zero when unknown.
    pub fn with_base_fee(mut self, base_fee_wei: u128) -> Self {
        self.base_fee = BigUint::from(base_fee_wei);
        self
    }

    pub fn fee_floor(&self) -> Amount {
        self.fee_floor
    }

    pub fn normalize(
        &self,
        raw: &[u8],
        claimed_hash: Option<&Hash32>,
        hint: Option<&ParsedHint>,
        now: UnixTime,
    ) -> Result<Transaction, NormalizeError> {
        let hash = Hash32(keccak256(raw));
        if let Some(claimed) = claimed_hash {
            if *claimed != hash {
                return Err(NormalizeError::HashMismatch { claimed: *claimed, computed: hash });
            }
        }

        let env = Envelope::decode(raw)?;
        let hint = hint.cloned().unwrap_or_default();

        let from = match hint.from.as_deref() {
            Some(s) => parse_address(s)?,
            None => self.recovery.recover_address(raw)?,
        };
        check_hint(&env, &hint)?;
        let to = match (env.to, hint.to.as_deref()) {
            (Some(bytes), Some(s)) => {
                let envelope = Address::from_bytes(bytes);
                agree("to", Some(parse_address(s)?), Some(envelope.clone()))?;
                envelope
            }
            (Some(bytes), None) => Address::from_bytes(bytes),
            (None, Some(s)) => parse_address(s)?,
            (None, None) => return Err(NormalizeError::InvalidAddress("missing recipient".into())),
        };
        if from.is_zero() || to.is_zero() {
            return Err(NormalizeError::ZeroAddressRejected);
        }

        let amount = wei_to_amount(&env.value)?;
        let price = env.effective_gas_price(&self.base_fee);
        let gas_price = price
            .to_u128()
            .ok_or_else(|| NormalizeError::GasPriceOverflow(price.to_str_radix(10)))?;
        let fee = wei_to_amount(&(BigUint::from(env.gas_limit) * &price))?.max(self.fee_floor);

        Ok(Transaction {
            hash,
            tx_type: env.tx_type,
            from,
            to,
            amount,
            fee,
            nonce: env.nonce,
            gas_limit: env.gas_limit,
            gas_price,
            signature: env.signature_bytes(),
            status: TxStatus::Pending,
            timestamp: now,
            block_height: None,
        })
    }
}

fn parse_address(s: &str) -> Result<Address, NormalizeError> {
    Address::parse(s).map_err(|_| NormalizeError::InvalidAddress(s.to_string()))
}

fn agree<T: PartialEq + std::fmt::Display>(
    field: &'static str,
    hint: Option<T>,
    envelope: Option<T>,
) -> Result<(), NormalizeError> {
    match (hint, envelope) {
        (Some(h), Some(e)) if h != e => {
            Err(NormalizeError::HintMismatch { field, hint: h.to_string(), envelope: e.to_string() })
        }
        _ => Ok(()),
    }
}

/// Numeric hint fields against the decoded envelope. Wei amounts are hex.
fn check_hint(env: &Envelope, hint: &ParsedHint) -> Result<(), NormalizeError> {
    let wei = |v: &Option<String>| v.as_deref().map(parse_hex).transpose();
    agree("value", wei(&hint.value)?, Some(env.value.clone()))?;
    agree("nonce", hint.nonce, Some(env.nonce))?;
    agree("gasLimit", hint.gas_limit, Some(env.gas_limit))?;
    agree("gasPrice", wei(&hint.gas_price)?, env.gas_price.clone())?;
    agree("maxFeePerGas", wei(&hint.max_fee_per_gas)?, env.max_fee_per_gas.clone())?;
    agree("maxPriorityFeePerGas", wei(&hint.max_priority_fee_per_gas)?, env.max_priority_fee_per_gas.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::rlp::RlpStream;

    struct FixedSender(Address);

    impl AddressRecovery for FixedSender {
        fn recover_address(&self, _raw: &[u8]) -> Result<Address, RecoveryError> {
            Ok(self.0.clone())
        }
    }

    fn sender() -> Address {
        Address::parse("0x1111111111111111111111111111111111111111").unwrap()
    }

    fn raw_legacy(to: &[u8], value_wei: u128, gas_price: u64, gas: u64) -> Vec<u8> {
        let mut s = RlpStream::new_list(9);
        s.append(&1u64);
        s.append(&gas_price);
        s.append(&gas);
        s.append(&to);
        s.append(&value_wei);
        s.append(&"");
        s.append(&27u8);
        s.append(&[1u8; 32].as_slice());
        s.append(&[2u8; 32].as_slice());
        s.out().to_vec()
    }

    fn normalizer(floor: &str) -> Normalizer<FixedSender> {
        Normalizer::with_recovery(floor.parse().unwrap(), FixedSender(sender()))
    }

    #[test]
    fn canonical_fields() {
        let raw = raw_legacy(&[0xAB; 20], 2_500_000_000_000_000_000, 1_000_000_000, 21_000);
        let tx = normalizer("0.0001").normalize(&raw, None, None, 100).unwrap();
        assert_eq!(tx.hash, Hash32(keccak256(&raw)));
        assert_eq!(tx.to.as_str(), "0xabababababababababababababababababababab");
        assert_eq!(tx.amount.to_string(), "2.50000000");
        // 21000 gwei = 0.000021 token, below the floor
        assert_eq!(tx.fee.to_string(), "0.00010000");
        assert_eq!(tx.gas_price, 1_000_000_000);
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.timestamp, 100);
    }

    #[test]
    fn zero_fee_is_raised_to_floor() {
        let raw = raw_legacy(&[0xAB; 20], 1, 0, 21_000);
        let tx = normalizer("0.001").normalize(&raw, None, None, 0).unwrap();
        assert_eq!(tx.fee, "0.001".parse().unwrap());
    }

    #[test]
    fn fee_above_floor_is_kept() {
        let raw = raw_legacy(&[0xAB; 20], 0, 100_000_000_000, 100_000);
        let tx = normalizer("0.001").normalize(&raw, None, None, 0).unwrap();
        assert_eq!(tx.fee.to_string(), "0.01000000");
    }

    #[test]
    fn hash_mismatch_rejected() {
        let raw = raw_legacy(&[0xAB; 20], 1, 1, 1);
        let err = normalizer("0").normalize(&raw, Some(&Hash32([9; 32])), None, 0).unwrap_err();
        assert!(matches!(err, NormalizeError::HashMismatch { .. }));
        assert_eq!(err.label(), "hash_mismatch");
    }

    #[test]
    fn zero_recipient_rejected() {
        let raw = raw_legacy(&[0u8; 20], 1, 1, 1);
        assert_eq!(
            normalizer("0").normalize(&raw, None, None, 0),
            Err(NormalizeError::ZeroAddressRejected)
        );
    }

    #[test]
    fn hint_fills_sender_and_empty_recipient() {
        let raw = raw_legacy(&[], 1, 1, 1);
        let hint = ParsedHint {
            from: Some("0x2222222222222222222222222222222222222222".into()),
            to: Some("0x3333333333333333333333333333333333333333".into()),
            ..ParsedHint::default()
        };
        let tx = normalizer("0").normalize(&raw, None, Some(&hint), 0).unwrap();
        assert_eq!(tx.from.as_str(), "0x2222222222222222222222222222222222222222");
        assert_eq!(tx.to.as_str(), "0x3333333333333333333333333333333333333333");

        let bad = ParsedHint { from: Some("0x12".into()), ..hint };
        assert!(matches!(
            normalizer("0").normalize(&raw, None, Some(&bad), 0),
            Err(NormalizeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn missing_recipient_without_hint() {
        let raw = raw_legacy(&[], 1, 1, 1);
        assert!(matches!(
            normalizer("0").normalize(&raw, None, None, 0),
            Err(NormalizeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = normalizer("0").normalize(&[0xff, 0x00], None, None, 0).unwrap_err();
        assert_eq!(err.label(), "decode");
    }

    #[test]
    fn hint_fields_must_match_the_envelope() {
        // 1 token at 1 gwei, nonce 1, 21000 gas
        let raw = raw_legacy(&[0xAB; 20], 1_000_000_000_000_000_000, 1_000_000_000, 21_000);
        let agreeing = ParsedHint {
            to: Some("0xABABABABABABABABABABABABABABABABABABABAB".into()),
            value: Some("0xde0b6b3a7640000".into()),
            nonce: Some(1),
            gas_limit: Some(21_000),
            gas_price: Some("0x3b9aca00".into()),
            ..ParsedHint::default()
        };
        let tx = normalizer("0").normalize(&raw, None, Some(&agreeing), 0).unwrap();
        assert_eq!(tx.amount.to_string(), "1.00000000");

        let cases = [
            ("value", ParsedHint { value: Some("0x1".into()), ..agreeing.clone() }),
            ("nonce", ParsedHint { nonce: Some(2), ..agreeing.clone() }),
            ("gasLimit", ParsedHint { gas_limit: Some(50_000), ..agreeing.clone() }),
            ("gasPrice", ParsedHint { gas_price: Some("0x1".into()), ..agreeing.clone() }),
            ("to", ParsedHint { to: Some("0x3333333333333333333333333333333333333333".into()), ..agreeing.clone() }),
        ];
        for (want, hint) in cases {
            let err = normalizer("0").normalize(&raw, None, Some(&hint), 0).unwrap_err();
            assert!(matches!(err, NormalizeError::HintMismatch { field, .. } if field == want), "{want}: {err}");
            assert_eq!(err.label(), "hint_mismatch");
        }

        // fee-market fields a legacy envelope does not carry are left alone
        let extra = ParsedHint { max_fee_per_gas: Some("0x5".into()), ..agreeing.clone() };
        assert!(normalizer("0").normalize(&raw, None, Some(&extra), 0).is_ok());

        let garbage = ParsedHint { value: Some("0xzz".into()), ..agreeing };
        assert_eq!(normalizer("0").normalize(&raw, None, Some(&garbage), 0).unwrap_err().label(), "value_range");
    }
}
