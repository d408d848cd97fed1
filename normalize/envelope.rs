//! Signed transaction envelopes.
//!
//! A leading `0x01` / `0x02` byte selects the access-list / fee-market
//! layout; anything else is a plain legacy list:
//!
//! legacy: [nonce, gasPrice, gasLimit, to, value, data, v, r, s]
//! 0x01:   [chainId, nonce, gasPrice, gasLimit, to, value, data, accessList, yParity, r, s]
//! 0x02:   [chainId, nonce, maxPriorityFee, maxFee, gasLimit, to, value, data, accessList, yParity, r, s]

use super::bigint::{parse_hex, ValueError};
use super::rlp::{self, append_item, RlpError, RlpItem};
use crate::types::{keccak256, TxType};
use num_bigint::BigUint;
use ::rlp::RlpStream;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("rlp: {0}")]
    Rlp(#[from] RlpError),
    #[error("envelope is not a list")]
    NotAList,
    #[error("{tx_type:?} envelope needs {expected} fields, got {got}")]
    FieldCount { tx_type: TxType, expected: usize, got: usize },
    #[error("field {field} is {len} bytes, max {max}")]
    FieldLength { field: &'static str, len: usize, max: usize },
    #[error("value: {0}")]
    Value(#[from] ValueError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub tx_type: TxType,
    pub chain_id: Option<u64>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Option<BigUint>,
    pub max_priority_fee_per_gas: Option<BigUint>,
    pub max_fee_per_gas: Option<BigUint>,
    /// `None` when the recipient field is empty.
    pub to: Option<[u8; 20]>,
    pub value: BigUint,
    /// Legacy `v` (27/28 or EIP-155) or typed `yParity`.
    pub v: u64,
    pub r: [u8; 32],
    pub s: [u8; 32],
    unsigned: Vec<RlpItem>,
}

struct Layout {
    tx_type: TxType,
    fields: usize,
    chain_id: Option<usize>,
    nonce: usize,
    gas_price: Option<usize>,
    max_priority: Option<usize>,
    max_fee: Option<usize>,
    gas_limit: usize,
    to: usize,
    value: usize,
    /// Fields before this index form the signing preimage.
    v: usize,
}

const LEGACY: Layout = Layout {
    tx_type: TxType::Legacy,
    fields: 9,
    chain_id: None,
    nonce: 0,
    gas_price: Some(1),
    max_priority: None,
    max_fee: None,
    gas_limit: 2,
    to: 3,
    value: 4,
    v: 6,
};

const ACCESS_LIST: Layout = Layout {
    tx_type: TxType::AccessList,
    fields: 11,
    chain_id: Some(0),
    nonce: 1,
    gas_price: Some(2),
    max_priority: None,
    max_fee: None,
    gas_limit: 3,
    to: 4,
    value: 5,
    v: 8,
};

const FEE_MARKET: Layout = Layout {
    tx_type: TxType::FeeMarket,
    fields: 12,
    chain_id: Some(0),
    nonce: 1,
    gas_price: None,
    max_priority: Some(2),
    max_fee: Some(3),
    gas_limit: 4,
    to: 5,
    value: 6,
    v: 9,
};

fn quantity(item: &RlpItem, field: usize) -> Result<BigUint, DecodeError> {
    Ok(parse_hex(&item.as_hex_quantity(field)?)?)
}

fn word(item: &RlpItem, field: usize, name: &'static str) -> Result<[u8; 32], DecodeError> {
    let b = item.as_bytes(field)?;
    if b.len() > 32 {
        return Err(DecodeError::FieldLength { field: name, len: b.len(), max: 32 });
    }
    let mut out = [0u8; 32];
    out[32 - b.len()..].copy_from_slice(b);
    Ok(out)
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let (layout, body) = match raw.first() {
            Some(0x01) => (&ACCESS_LIST, &raw[1..]),
            Some(0x02) => (&FEE_MARKET, &raw[1..]),
            _ => (&LEGACY, raw),
        };
        let items = match rlp::decode(body)? {
            RlpItem::List(items) => items,
            RlpItem::Bytes(_) => return Err(DecodeError::NotAList),
        };
        if items.len() != layout.fields {
            return Err(DecodeError::FieldCount {
                tx_type: layout.tx_type,
                expected: layout.fields,
                got: items.len(),
            });
        }

        let opt_quantity = |idx: Option<usize>| idx.map(|i| quantity(&items[i], i)).transpose();

        let to_bytes = items[layout.to].as_bytes(layout.to)?;
        let to = match to_bytes.len() {
            0 => None,
            20 => {
                let mut a = [0u8; 20];
                a.copy_from_slice(to_bytes);
                Some(a)
            }
            n => return Err(DecodeError::FieldLength { field: "to", len: n, max: 20 }),
        };

        // typed envelopes carry an access list right before the signature
        if layout.tx_type != TxType::Legacy {
            items[layout.v - 1].as_list(layout.v - 1)?;
        }

        Ok(Self {
            tx_type: layout.tx_type,
            chain_id: layout.chain_id.map(|i| items[i].as_u64(i)).transpose()?,
            nonce: items[layout.nonce].as_u64(layout.nonce)?,
            gas_limit: items[layout.gas_limit].as_u64(layout.gas_limit)?,
            gas_price: opt_quantity(layout.gas_price)?,
            max_priority_fee_per_gas: opt_quantity(layout.max_priority)?,
            max_fee_per_gas: opt_quantity(layout.max_fee)?,
            to,
            value: quantity(&items[layout.value], layout.value)?,
            v: items[layout.v].as_u64(layout.v)?,
            r: word(&items[layout.v + 1], layout.v + 1, "r")?,
            s: word(&items[layout.v + 2], layout.v + 2, "s")?,
            unsigned: items[..layout.v].to_vec(),
        })
    }

    /// EIP-155 chain id implied by a legacy `v`.
    pub fn legacy_chain_id(&self) -> Option<u64> {
        (self.tx_type == TxType::Legacy && self.v >= 35).then(|| (self.v - 35) / 2)
    }

    /// Bytes the sender signed.
    pub fn signing_preimage(&self) -> Vec<u8> {
        match self.tx_type {
            TxType::Legacy => {
                let chain_id = self.legacy_chain_id();
                let mut s = RlpStream::new_list(self.unsigned.len() + if chain_id.is_some() { 3 } else { 0 });
                for item in &self.unsigned {
                    append_item(&mut s, item);
                }
                if let Some(cid) = chain_id {
                    s.append(&cid);
                    s.append(&0u8);
                    s.append(&0u8);
                }
                s.out().to_vec()
            }
            TxType::AccessList | TxType::FeeMarket => {
                let mut s = RlpStream::new_list(self.unsigned.len());
                for item in &self.unsigned {
                    append_item(&mut s, item);
                }
                let prefix = if self.tx_type == TxType::AccessList { 0x01 } else { 0x02 };
                let mut out = vec![prefix];
                out.extend_from_slice(&s.out());
                out
            }
        }
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_preimage())
    }

    /// `r || s || v` as carried on the wire.
    pub fn signature_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out.push((self.v & 0xff) as u8);
        out
    }

    /// Effective gas price: `min(maxFee, baseFee + maxPriorityFee)` for
    /// fee-market envelopes, `gasPrice` otherwise.
    pub fn effective_gas_price(&self, base_fee: &BigUint) -> BigUint {
        match (&self.gas_price, &self.max_fee_per_gas, &self.max_priority_fee_per_gas) {
            (Some(p), _, _) => p.clone(),
            (None, Some(max_fee), Some(tip)) => std::cmp::min(max_fee.clone(), base_fee + tip),
            (None, Some(max_fee), None) => max_fee.clone(),
            (None, None, _) => BigUint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_raw(v: u64) -> Vec<u8> {
        let mut s = RlpStream::new_list(9);
        s.append(&7u64);
        s.append(&1_000_000_000u64);
        s.append(&21_000u64);
        s.append(&[0x11u8; 20].as_slice());
        s.append(&vec![0x0du8, 0xe0, 0xb6, 0xb3, 0xa7, 0x64, 0x00, 0x00]);
        s.append(&"");
        s.append(&v);
        s.append(&[0x22u8; 32].as_slice());
        s.append(&[0x33u8; 32].as_slice());
        s.out().to_vec()
    }

    #[test]
    fn legacy_fields() {
        let env = Envelope::decode(&legacy_raw(37)).unwrap();
        assert_eq!(env.tx_type, TxType::Legacy);
        assert_eq!(env.nonce, 7);
        assert_eq!(env.gas_limit, 21_000);
        assert_eq!(env.to, Some([0x11; 20]));
        assert_eq!(env.value, BigUint::from(1_000_000_000_000_000_000u64));
        assert_eq!(env.legacy_chain_id(), Some(1));
        assert_eq!(env.signature_bytes().len(), 65);
    }

    #[test]
    fn legacy_preimage_includes_chain_id_only_for_eip155() {
        let pre155 = Envelope::decode(&legacy_raw(27)).unwrap();
        let eip155 = Envelope::decode(&legacy_raw(37)).unwrap();
        assert!(eip155.signing_preimage().len() > pre155.signing_preimage().len());
        assert_eq!(pre155.legacy_chain_id(), None);
    }

    #[test]
    fn fee_market_effective_price() {
        let mut s = RlpStream::new_list(12);
        s.append(&1u64);
        s.append(&0u64);
        s.append(&2u64); // tip
        s.append(&10u64); // max fee
        s.append(&21_000u64);
        s.append(&[0x44u8; 20].as_slice());
        s.append(&0u64);
        s.append(&"");
        s.begin_list(0);
        s.append(&1u8);
        s.append(&[0x22u8; 32].as_slice());
        s.append(&[0x33u8; 32].as_slice());
        let mut raw = vec![0x02];
        raw.extend_from_slice(&s.out());

        let env = Envelope::decode(&raw).unwrap();
        assert_eq!(env.tx_type, TxType::FeeMarket);
        assert_eq!(env.effective_gas_price(&BigUint::from(0u32)), BigUint::from(2u32));
        assert_eq!(env.effective_gas_price(&BigUint::from(5u32)), BigUint::from(7u32));
        assert_eq!(env.effective_gas_price(&BigUint::from(50u32)), BigUint::from(10u32));
        assert_eq!(env.signing_preimage()[0], 0x02);
    }

    #[test]
    fn rejects_wrong_shapes() {
        let mut s = RlpStream::new_list(3);
        s.append(&1u8);
        s.append(&2u8);
        s.append(&3u8);
        assert!(matches!(
            Envelope::decode(&s.out()),
            Err(DecodeError::FieldCount { expected: 9, got: 3, .. })
        ));
        assert!(matches!(Envelope::decode(&[0x83, 1, 2, 3]), Err(DecodeError::NotAList)));
        assert!(matches!(Envelope::decode(&[0x02]), Err(DecodeError::Rlp(RlpError::Empty))));
    }
}
