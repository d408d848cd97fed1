//! Block assembly and signing.
//!
//! The producer walks the best-first mempool selection through the block
//! content rules, stamps the survivors with the new height and seals the
//! header with the producer's ed25519 key.
//!
//! Block content rules, shared by production and validation:
//! - no hash or (from, to, amount, nonce) content that is already confirmed
//! - every nonce above the sender's highest confirmed nonce
//! - inside one block: hashes and content distinct, and each sender's
//!   nonces strictly increasing in block order

use crate::crypto::{CryptoError, Signer};
use crate::ledger::CommitReceipt;
use crate::mempool::ConfirmedIndex;
use crate::merkle::merkle_root;
use crate::types::{Address, Block, BlockHeader, Fingerprint, Hash32, Height, Transaction, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// What one production attempt did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProduceOutcome {
    /// Block signed and written. `partial` is set when only the binary tier
    /// accepted it and the mirror needs reconciling.
    Produced { receipt: CommitReceipt, producer: Address, partial: bool },
    /// The selected producer's key is not held locally. Nothing is written;
    /// the height stays open for whoever holds that key.
    Missed { height: Height, producer: Address },
    /// Nothing pending.
    Idle { height: Height },
}

/// Why a transaction cannot go into the block being built or checked.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ContentViolation {
    #[error("tx {0} already confirmed")]
    ConfirmedHash(Hash32),
    #[error("tx {0} repeats confirmed content")]
    ConfirmedContent(Hash32),
    #[error("tx {hash} nonce {nonce} not above confirmed nonce {confirmed}")]
    StaleNonce { hash: Hash32, nonce: u64, confirmed: u64 },
    #[error("tx {0} appears twice")]
    RepeatedHash(Hash32),
    #[error("tx {0} repeats content earlier in the block")]
    RepeatedContent(Hash32),
    #[error("tx {hash} nonce {nonce} not above the sender's previous nonce {previous} in the block")]
    NonceOrder { hash: Hash32, nonce: u64, previous: u64 },
}

/// Running state of the in-block rules.
#[derive(Default)]
pub struct BlockContent {
    hashes: HashSet<Hash32>,
    fingerprints: HashSet<Fingerprint>,
    last_nonce: HashMap<Address, u64>,
}

impl BlockContent {
    fn check_in_block(&self, tx: &Transaction) -> Result<(), ContentViolation> {
        if self.hashes.contains(&tx.hash) {
            return Err(ContentViolation::RepeatedHash(tx.hash));
        }
        if self.fingerprints.contains(&tx.fingerprint()) {
            return Err(ContentViolation::RepeatedContent(tx.hash));
        }
        if let Some(&previous) = self.last_nonce.get(&tx.from) {
            if tx.nonce <= previous {
                return Err(ContentViolation::NonceOrder { hash: tx.hash, nonce: tx.nonce, previous });
            }
        }
        Ok(())
    }

    /// Check `tx` against confirmed history and what this block already
    /// holds; on success it becomes part of the block.
    pub fn push(&mut self, tx: &Transaction, confirmed: Option<&dyn ConfirmedIndex>) -> Result<(), ContentViolation> {
        if let Some(c) = confirmed {
            if c.contains_hash(&tx.hash) {
                return Err(ContentViolation::ConfirmedHash(tx.hash));
            }
            if c.contains_fingerprint(&tx.fingerprint()) {
                return Err(ContentViolation::ConfirmedContent(tx.hash));
            }
            if let Some(max) = c.max_nonce(&tx.from) {
                if tx.nonce <= max {
                    return Err(ContentViolation::StaleNonce { hash: tx.hash, nonce: tx.nonce, confirmed: max });
                }
            }
        }
        self.check_in_block(tx)?;
        self.hashes.insert(tx.hash);
        self.fingerprints.insert(tx.fingerprint());
        self.last_nonce.insert(tx.from.clone(), tx.nonce);
        Ok(())
    }
}

/// First `limit` candidates, in order, that satisfy the block content rules.
pub fn select_batch(
    candidates: impl IntoIterator<Item = Transaction>,
    confirmed: &dyn ConfirmedIndex,
    limit: usize,
) -> Vec<Transaction> {
    let mut content = BlockContent::default();
    candidates
        .into_iter()
        .filter(|tx| content.push(tx, Some(confirmed)).is_ok())
        .take(limit)
        .collect()
}

/// Check a block body against the content rules.
pub fn check_block_content(txs: &[Transaction], confirmed: &dyn ConfirmedIndex) -> Result<(), ContentViolation> {
    let mut content = BlockContent::default();
    txs.iter().try_for_each(|tx| content.push(tx, Some(confirmed)))
}

/// Unsigned block on top of `(parent_height, parent_hash)`. Candidates that
/// break the in-block rules are skipped.
pub fn assemble(
    parent_height: Height,
    parent_hash: Hash32,
    creator: Address,
    candidates: impl IntoIterator<Item = Transaction>,
    timestamp: UnixTime,
) -> Block {
    let height = parent_height + 1;
    let mut content = BlockContent::default();
    let transactions: Vec<Transaction> = candidates
        .into_iter()
        .filter(|tx| content.push(tx, None).is_ok())
        .map(|tx| tx.confirmed_at(height))
        .collect();
    let hashes: Vec<Hash32> = transactions.iter().map(|t| t.hash).collect();
    let header = BlockHeader {
        height,
        previous_hash: parent_hash,
        merkle_root: merkle_root(&hashes),
        timestamp,
        creator,
        tx_count: transactions.len() as u32,
    };
    Block { hash: header.hash(), header, signature: Vec::new(), transactions }
}

pub fn sign_block<S: Signer + ?Sized>(mut block: Block, signer: &S) -> Result<Block, CryptoError> {
    block.signature = signer.sign(&block.header.sign_bytes())?.0;
    Ok(block)
}
