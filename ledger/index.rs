use crate::mempool::ConfirmedIndex;
use crate::types::{Address, Block, Fingerprint, Hash32};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Confirmed hashes, fingerprints and per-sender max nonce, rebuilt from the
/// binary ledger at open and extended on every commit.
#[derive(Default, Debug)]
pub struct ConfirmedSet {
    hashes: HashSet<Hash32>,
    fingerprints: HashSet<Fingerprint>,
    max_nonce: HashMap<Address, u64>,
}

impl ConfirmedSet {
    pub fn add_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.hashes.insert(tx.hash);
            self.fingerprints.insert(tx.fingerprint());
            let n = self.max_nonce.entry(tx.from.clone()).or_insert(tx.nonce);
            if tx.nonce > *n {
                *n = tx.nonce;
            }
        }
    }

    pub fn tx_count(&self) -> usize {
        self.hashes.len()
    }
}

/// Shared, lock-protected view handed to the mempool.
#[derive(Default, Debug)]
pub struct SharedIndex {
    inner: RwLock<ConfirmedSet>,
}

impl SharedIndex {
    pub fn from_blocks<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        let mut set = ConfirmedSet::default();
        for b in blocks {
            set.add_block(b);
        }
        Self { inner: RwLock::new(set) }
    }

    pub fn add_block(&self, block: &Block) {
        self.inner.write().add_block(block);
    }

    pub fn tx_count(&self) -> usize {
        self.inner.read().tx_count()
    }
}

impl ConfirmedIndex for SharedIndex {
    fn contains_hash(&self, hash: &Hash32) -> bool {
        self.inner.read().hashes.contains(hash)
    }

    fn contains_fingerprint(&self, fp: &Fingerprint) -> bool {
        self.inner.read().fingerprints.contains(fp)
    }

    fn max_nonce(&self, from: &Address) -> Option<u64> {
        self.inner.read().max_nonce.get(from).copied()
    }
}
