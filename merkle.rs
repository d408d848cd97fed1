//! Deterministic Merkle root over the transaction hashes of a block.
//!
//! - Leaves keep block order (selection order is already deterministic)
//! - Leaf: H(0x00 || tx_hash)
//! - Internal node: H(0x01 || left || right)
//! - Odd level: the last node is paired with itself
//! - Empty block: H(b"empty")

use crate::types::Hash32;
use sha2::{Digest, Sha256};

pub fn merkle_root(tx_hashes: &[Hash32]) -> Hash32 {
    if tx_hashes.is_empty() {
        let mut h = Sha256::new();
        h.update(b"empty");
        return Hash32(h.finalize().into());
    }

    let mut level: Vec<[u8; 32]> = tx_hashes.iter().map(|t| leaf_hash(&t.0)).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [l, r] => node_hash(l, r),
                [l] => node_hash(l, l),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    Hash32(level[0])
}

fn leaf_hash(tx_hash: &[u8; 32]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(b"\x00");
    h.update(tx_hash);
    h.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(b"\x01");
    h.update(left);
    h.update(right);
    h.finalize().into()
}
