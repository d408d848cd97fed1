use crate::crypto::PublicKeyBytes;
use crate::types::{Address, Amount, Hash32, Height};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stake weight in base units.
pub type Weight = u128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    Active,
    Inactive,
    Jailed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub public_key: PublicKeyBytes,
    pub stake: Amount,
    pub delegated_stake: Amount,
    /// Basis points.
    pub commission_rate: u16,
    pub status: ValidatorStatus,
    pub blocks_produced: u64,
    pub blocks_missed: u64,
    #[serde(default)]
    pub jail_until_block: Option<Height>,
}

impl Validator {
    pub fn new(public_key: PublicKeyBytes, stake: Amount) -> Self {
        Self {
            address: crate::crypto::address_from_public_key(&public_key),
            public_key,
            stake,
            delegated_stake: Amount::ZERO,
            commission_rate: 0,
            status: ValidatorStatus::Active,
            blocks_produced: 0,
            blocks_missed: 0,
            jail_until_block: None,
        }
    }

    pub fn weight(&self) -> Weight {
        self.stake.units().saturating_add(self.delegated_stake.units())
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }
}

/// Validators kept sorted by address; selection and hashing depend on that order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    vals: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(mut vals: Vec<Validator>) -> Self {
        vals.sort_by(|a, b| a.address.cmp(&b.address));
        vals.dedup_by(|a, b| a.address == b.address);
        Self { vals }
    }

    pub fn validators(&self) -> &[Validator] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.vals
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| &self.vals[i])
    }

    fn get_mut(&mut self, address: &Address) -> Option<&mut Validator> {
        match self.vals.binary_search_by(|v| v.address.cmp(address)) {
            Ok(i) => Some(&mut self.vals[i]),
            Err(_) => None,
        }
    }

    /// Insert or replace by address.
    pub fn upsert(&mut self, v: Validator) {
        match self.vals.binary_search_by(|x| x.address.cmp(&v.address)) {
            Ok(i) => self.vals[i] = v,
            Err(i) => self.vals.insert(i, v),
        }
    }

    /// Insert only when the address is unknown. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, v: Validator) -> bool {
        match self.vals.binary_search_by(|x| x.address.cmp(&v.address)) {
            Ok(_) => false,
            Err(i) => {
                self.vals.insert(i, v);
                true
            }
        }
    }

    pub fn total_weight(&self) -> Weight {
        self.vals
            .iter()
            .filter(|v| v.is_active())
            .fold(0u128, |acc, v| acc.saturating_add(v.weight()))
    }

    /// Return jailed validators whose term ended before `height` to active.
    pub fn release_expired(&mut self, height: Height) -> Vec<Address> {
        let mut released = Vec::new();
        for v in self.vals.iter_mut() {
            if v.status == ValidatorStatus::Jailed && v.jail_until_block.map_or(true, |until| until < height) {
                v.status = ValidatorStatus::Active;
                v.jail_until_block = None;
                released.push(v.address.clone());
            }
        }
        released
    }

    /// Stake-weighted producer for `height` on top of `previous_hash`.
    ///
    /// seed = sha256(previous_hash || height LE), first 16 bytes big-endian,
    /// reduced modulo the total active weight and walked over the cumulative
    /// weights of the address-sorted active validators.
    pub fn select_producer(&self, previous_hash: &Hash32, height: Height) -> Option<&Validator> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let mut h = Sha256::new();
        h.update(previous_hash.0);
        h.update(height.to_le_bytes());
        let digest: [u8; 32] = h.finalize().into();
        let mut seed = [0u8; 16];
        seed.copy_from_slice(&digest[..16]);
        let mut target = u128::from_be_bytes(seed) % total;

        for v in self.vals.iter().filter(|v| v.is_active() && v.weight() > 0) {
            if target < v.weight() {
                return Some(v);
            }
            target -= v.weight();
        }
        None
    }

    pub fn record_produced(&mut self, address: &Address) {
        if let Some(v) = self.get_mut(address) {
            v.blocks_produced += 1;
        }
    }

    /// Deterministic hash of the set, for status reports.
    pub fn hash_hex(&self) -> String {
        let bytes = bincode::serialize(&self.vals).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}
