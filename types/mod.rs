use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod entities;

pub use entities::*;

pub type Height = u64;
pub type UnixTime = u64;

/// Base units per whole token in the stored representation (8 displayed decimals).
pub const UNITS_PER_TOKEN: u128 = 100_000_000;
/// Decimal places of the wire value (smallest unit).
pub const WIRE_DECIMALS: u32 = 18;
/// Decimal places kept after normalization.
pub const DISPLAY_DECIMALS: u32 = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self { Self([0u8; 32]) }

    pub fn is_zero(&self) -> bool { self.0 == [0u8; 32] }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| format!("hash hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("hash must be 32 bytes, got {}", bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    Invalid(String),
}

/// Canonical account address: `0x` + 40 lowercase hex digits.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and case-normalize. Accepts the all-zero sentinel; callers that
    /// must reject it check `is_zero`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressError::Invalid(s.to_string()));
        }
        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(b)))
    }

    pub fn zero() -> Self {
        Self::from_bytes([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for Address {
    type Error = AddressError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Address::parse(&s) }
}

impl From<Address> for String {
    fn from(a: Address) -> String { a.0 }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Address({})", self.0) }
}

/// Fixed-point token amount stored as integer base units (1e-8 token).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(u128);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("malformed amount {0:?}")]
    Malformed(String),
    #[error("amount {0} has more than 8 fractional digits")]
    TooPrecise(String),
    #[error("amount {0} out of range")]
    Overflow(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_units(units: u128) -> Self { Self(units) }

    pub fn units(&self) -> u128 { self.0 }

    pub fn is_zero(&self) -> bool { self.0 == 0 }

    pub fn saturating_add(self, other: Amount) -> Amount { Amount(self.0.saturating_add(other.0)) }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08}", self.0 / UNITS_PER_TOKEN, self.0 % UNITS_PER_TOKEN)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Amount({self})") }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        let digits_ok = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if int_part.is_empty() || !digits_ok(int_part) || !digits_ok(frac_part) {
            return Err(AmountError::Malformed(s.to_string()));
        }
        if frac_part.len() > DISPLAY_DECIMALS as usize {
            return Err(AmountError::TooPrecise(s.to_string()));
        }
        let whole: u128 = int_part.parse().map_err(|_| AmountError::Overflow(s.to_string()))?;
        let mut frac: u128 = 0;
        for (i, b) in frac_part.bytes().enumerate() {
            frac += (b - b'0') as u128 * 10u128.pow(DISPLAY_DECIMALS - 1 - i as u32);
        }
        whole
            .checked_mul(UNITS_PER_TOKEN)
            .and_then(|w| w.checked_add(frac))
            .map(Amount)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Legacy,
    AccessList,
    FeeMarket,
}

/// Canonical transaction record. Immutable once hashed; only `status` and
/// `block_height` change when the transaction is confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash32,
    pub tx_type: TxType,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub nonce: u64,
    pub gas_limit: u64,
    /// Effective gas price in wei.
    pub gas_price: u128,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub status: TxStatus,
    pub timestamp: UnixTime,
    #[serde(default)]
    pub block_height: Option<Height>,
}

/// (sender, recipient, amount, nonce): duplicate detection independent of encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub nonce: u64,
}

impl Transaction {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            from: self.from.clone(),
            to: self.to.clone(),
            amount: self.amount,
            nonce: self.nonce,
        }
    }

    pub fn confirmed_at(mut self, height: Height) -> Self {
        self.status = TxStatus::Confirmed;
        self.block_height = Some(height);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: Height,
    pub previous_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: UnixTime,
    pub creator: Address,
    pub tx_count: u32,
}

impl BlockHeader {
    /// Fixed binary encoding signed by the producer and hashed into the block id.
    ///
    /// Format: "STAKE_BLK" || height(8 LE) || previous_hash(32) || merkle_root(32) ||
    ///         timestamp(8 LE) || creator_len(2 LE) || creator || tx_count(4 LE)
    pub fn sign_bytes(&self) -> Vec<u8> {
        let creator = self.creator.as_str().as_bytes();
        let mut buf = Vec::with_capacity(9 + 8 + 32 + 32 + 8 + 2 + creator.len() + 4);
        buf.extend_from_slice(b"STAKE_BLK");
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.previous_hash.0);
        buf.extend_from_slice(&self.merkle_root.0);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(creator.len() as u16).to_le_bytes());
        buf.extend_from_slice(creator);
        buf.extend_from_slice(&self.tx_count.to_le_bytes());
        buf
    }

    pub fn hash(&self) -> Hash32 {
        hash_bytes(&self.sign_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash32,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn height(&self) -> Height { self.header.height }

    pub fn previous_hash(&self) -> &Hash32 { &self.header.previous_hash }

    pub fn tx_hashes(&self) -> Vec<Hash32> {
        self.transactions.iter().map(|t| t.hash).collect()
    }

    pub fn is_genesis(&self) -> bool { self.header.height == 0 }
}

/// One page of a stable listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub has_more: bool,
}

/// Previous-hash value carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: Hash32 = Hash32([0u8; 32]);

pub fn hash_bytes(b: &[u8]) -> Hash32 {
    Hash32(*blake3::hash(b).as_bytes())
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(data);
    h.finalize().into()
}

pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_lowercased_and_prefixed() {
        let a = Address::parse("0xABCDEFabcdef0123456789ABCDEF0123456789ab").unwrap();
        assert_eq!(a.as_str(), "0xabcdefabcdef0123456789abcdef0123456789ab");
        let b = Address::parse("abcdefabcdef0123456789abcdef0123456789ab").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn address_rejects_wrong_width() {
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzzcdefabcdef0123456789abcdef0123456789ab").is_err());
        assert!(Address::zero().is_zero());
    }

    #[test]
    fn amount_display_and_parse() {
        let a: Amount = "12.5".parse().unwrap();
        assert_eq!(a.units(), 1_250_000_000);
        assert_eq!(a.to_string(), "12.50000000");
        assert_eq!("0.00000001".parse::<Amount>().unwrap().units(), 1);
        assert!("1.000000001".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
    }

    #[test]
    fn hash_serde_is_hex() {
        let h = hash_bytes(b"abc");
        let s = serde_json::to_string(&h).unwrap();
        assert!(s.starts_with("\"0x"));
        let back: Hash32 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, h);
    }
}
