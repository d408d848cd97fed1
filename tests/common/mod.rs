#![allow(dead_code)]

use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use stakenode::config::NodeConfig;
use stakenode::context::RunContext;
use stakenode::consensus::ProduceOutcome;
use stakenode::intake::IntakeRecord;
use stakenode::node::NodeCore;
use stakenode::types::{keccak256, Address, UnixTime};
use std::path::Path;

pub const CHAIN_ID: u64 = 1;
/// 1 gwei; with 21k gas the fee is 2100 base units, above the default floor.
pub const GAS_PRICE: u64 = 1_000_000_000;
pub const GAS: u64 = 21_000;

pub fn config(dir: &Path, node_id: &str) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.data_dir = dir.to_string_lossy().into_owned();
    cfg.node.node_id = node_id.into();
    cfg.genesis.chain_id = CHAIN_ID;
    cfg
}

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub fn address_of(sk: &SigningKey) -> Address {
    let point = sk.verifying_key().to_encoded_point(false);
    let h = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h[12..]);
    Address::from_bytes(out)
}

/// EIP-155 legacy transfer signed by `sk`.
pub fn signed_transfer(sk: &SigningKey, nonce: u64, to: [u8; 20], value_wei: u128, gas_price: u64) -> Vec<u8> {
    let fields = |s: &mut RlpStream| {
        s.append(&nonce);
        s.append(&gas_price);
        s.append(&GAS);
        s.append(&to.as_slice());
        s.append(&value_wei);
        s.append(&"");
    };
    let mut pre = RlpStream::new_list(9);
    fields(&mut pre);
    pre.append(&CHAIN_ID);
    pre.append(&0u8);
    pre.append(&0u8);
    let (sig, recid) = sk.sign_prehash_recoverable(&keccak256(&pre.out())).unwrap();
    let rs = sig.to_bytes();

    let mut s = RlpStream::new_list(9);
    fields(&mut s);
    s.append(&(CHAIN_ID * 2 + 35 + recid.to_byte() as u64));
    s.append(&rs[..32].to_vec());
    s.append(&rs[32..].to_vec());
    s.out().to_vec()
}

pub fn queue(node: &NodeCore, name: &str, raw: &[u8]) {
    let record = IntakeRecord { raw: format!("0x{}", hex::encode(raw)), hash: None, parsed: None };
    node.submit_raw(name, &record).unwrap();
}

/// Fresh node with one local validator and a genesis block at `now`.
pub fn genesis_node(dir: &Path, node_id: &str, now: UnixTime) -> NodeCore {
    let mut node = NodeCore::open(config(dir, node_id)).unwrap();
    node.generate_key().unwrap();
    node.init_genesis(now).unwrap();
    node
}

/// Reference chain: blocks 0..=10 holding 25 transfers in total
/// (three per block for heights 1-5, two for heights 6-10).
pub fn reference_chain(dir: &Path) -> NodeCore {
    let mut node = genesis_node(dir, "reference", 1_000);
    let senders: Vec<SigningKey> = (1..=5u8).map(key).collect();
    let mut nonces = [0u64; 5];
    let mut n = 0usize;
    for height in 1..=10u64 {
        let per_block = if height <= 5 { 3 } else { 2 };
        for _ in 0..per_block {
            let i = n % senders.len();
            let raw = signed_transfer(&senders[i], nonces[i], [0xA0 + i as u8; 20], 1_000_000_000_000 * (n as u128 + 1), GAS_PRICE);
            nonces[i] += 1;
            queue(&node, &format!("{n:04}"), &raw);
            n += 1;
        }
        let now = 1_000 + height * 10;
        let report = node.admit_intake(now, &RunContext::default()).unwrap();
        assert_eq!(report.accepted, per_block, "height {height}: {report:?}");
        match node.produce_block(now).unwrap() {
            ProduceOutcome::Produced { receipt, partial: false, .. } => assert_eq!(receipt.height, height),
            other => panic!("height {height}: {other:?}"),
        }
    }
    assert_eq!(node.height(), Some(10));
    assert_eq!(node.tx_count(), 25);
    node
}
