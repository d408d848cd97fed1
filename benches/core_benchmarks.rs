//! Criterion benchmarks for the hot paths of admission and production.
//!
//! Run: cargo bench --locked
//! Results written to target/criterion/

use stakenode::consensus::{Validator, ValidatorSet};
use stakenode::crypto::ed25519::Ed25519Keypair;
use stakenode::crypto::Signer;
use stakenode::ledger::index::SharedIndex;
use stakenode::mempool::{Mempool, PoolPolicy};
use stakenode::merkle::merkle_root;
use stakenode::normalize::bigint::{hex_to_decimal, parse_hex, wei_to_display};
use stakenode::types::{Address, Amount, Hash32, Transaction, TxStatus, TxType};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ── Helpers ──────────────────────────────────────────────────────────────

fn validators(n: usize) -> ValidatorSet {
    ValidatorSet::new(
        (0..n)
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
                let pk = Ed25519Keypair::from_seed(seed).public_key();
                Validator::new(pk, Amount::from_units(1_000 + i as u128 * 37))
            })
            .collect(),
    )
}

fn transfer(i: u64) -> Transaction {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&i.to_le_bytes());
    let mut from = [0u8; 20];
    from[..8].copy_from_slice(&i.to_le_bytes());
    Transaction {
        hash: Hash32(hash),
        tx_type: TxType::Legacy,
        from: Address::from_bytes(from),
        to: Address::from_bytes([0xEE; 20]),
        amount: Amount::from_units(i as u128),
        fee: Amount::from_units(1_000 + (i % 97) as u128),
        nonce: 0,
        gas_limit: 21_000,
        gas_price: 1,
        signature: vec![],
        status: TxStatus::Pending,
        timestamp: 0,
        block_height: None,
    }
}

// ── Value conversion ─────────────────────────────────────────────────────

fn bench_hex(c: &mut Criterion) {
    let mut group = c.benchmark_group("hex");

    for digits in [16usize, 32, 64] {
        let hex = format!("0x{}", "9f".repeat(digits / 2));
        group.bench_with_input(BenchmarkId::new("to_decimal", digits), &hex, |b, h| {
            b.iter(|| hex_to_decimal(black_box(h)))
        });
    }

    let wei = parse_hex("0xde0b6b3a7640000").unwrap();
    group.bench_function("wei_to_display", |b| b.iter(|| wei_to_display(black_box(&wei))));

    group.finish();
}

// ── Producer selection ──────────────────────────────────────────────────

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("producer_selection");

    for n in [4usize, 21, 100] {
        let set = validators(n);
        group.bench_with_input(BenchmarkId::new("select", n), &set, |b, set| {
            let prev = Hash32([7u8; 32]);
            let mut h = 0u64;
            b.iter(|| {
                h += 1;
                black_box(set.select_producer(&prev, h).map(|v| v.weight()))
            })
        });
    }

    group.finish();
}

// ── Mempool ─────────────────────────────────────────────────────────────

fn bench_mempool(c: &mut Criterion) {
    let mut group = c.benchmark_group("mempool");

    group.bench_function("admit_1000", |b| {
        let txs: Vec<Transaction> = (0..1000).map(transfer).collect();
        b.iter(|| {
            let pool = Mempool::new(PoolPolicy::default(), Arc::new(SharedIndex::default()));
            for tx in &txs {
                let _ = pool.admit(tx.clone(), 0);
            }
            black_box(pool.len())
        });
    });

    group.bench_function("select_500_of_5000", |b| {
        let pool = Mempool::new(PoolPolicy::default(), Arc::new(SharedIndex::default()));
        for i in 0..5000 {
            let _ = pool.admit(transfer(i), i);
        }
        b.iter(|| black_box(pool.select_for_block(500).count()));
    });

    group.finish();
}

// ── Merkle ──────────────────────────────────────────────────────────────

fn bench_merkle(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle");

    for n in [1usize, 100, 500] {
        let hashes: Vec<Hash32> = (0..n as u64).map(|i| transfer(i).hash).collect();
        group.bench_with_input(BenchmarkId::new("root", n), &hashes, |b, h| {
            b.iter(|| merkle_root(black_box(h)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hex, bench_selection, bench_mempool, bench_merkle);
criterion_main!(benches);
