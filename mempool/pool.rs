//! Pending transaction pool.
//!
//! - Admission checks run in a fixed order under one lock, so two concurrent
//!   admissions of the same hash cannot both pass
//! - Duplicate prevention across both tiers: pending entries here, confirmed
//!   history through `ConfirmedIndex`
//! - Priority: fee at admission, age-credited on every expiry sweep
//! - TTL: entries expire `ttl_secs` after admission
//! - Durable between invocations (`mempool.json`, written via `flush`)

use crate::storage::{read_json, write_json_atomic};
use crate::types::{Address, Amount, Fingerprint, Hash32, Page, Transaction, UnixTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, io};
use thiserror::Error;
use tracing::{debug, info};

const FILE_VERSION: u32 = 1;

/// Confirmed-transaction view the pool checks against.
pub trait ConfirmedIndex: Send + Sync {
    fn contains_hash(&self, hash: &Hash32) -> bool;
    fn contains_fingerprint(&self, fp: &Fingerprint) -> bool;
    /// Highest confirmed nonce for `from`, if any transaction was confirmed.
    fn max_nonce(&self, from: &Address) -> Option<u64>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("sender and recipient are the same address")]
    SelfTransfer,
    #[error("fee {fee} below floor {floor}")]
    FeeBelowFloor { fee: Amount, floor: Amount },
    #[error("transaction hash already pending or confirmed")]
    DuplicateHash,
    #[error("same (from, to, amount, nonce) already pending or confirmed")]
    DuplicateContent,
    #[error("nonce {nonce} not above confirmed nonce {confirmed}")]
    StaleNonce { nonce: u64, confirmed: u64 },
    #[error("pool at capacity")]
    PoolFull,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::SelfTransfer => "self_transfer",
            RejectReason::FeeBelowFloor { .. } => "fee_below_floor",
            RejectReason::DuplicateHash => "duplicate_hash",
            RejectReason::DuplicateContent => "duplicate_content",
            RejectReason::StaleNonce { .. } => "stale_nonce",
            RejectReason::PoolFull => "pool_full",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admitted {
    pub hash: Hash32,
    pub priority_score: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub priority_score: u128,
    pub created_at: UnixTime,
    pub expires_at: UnixTime,
}

impl MempoolEntry {
    fn is_expired(&self, now: UnixTime) -> bool {
        now > self.expires_at
    }

    /// `fee * (1 + age / age_boost_secs)`, linear in age.
    fn aged_score(&self, now: UnixTime, age_boost_secs: u64) -> u128 {
        let fee = self.tx.fee.units();
        let age = now.saturating_sub(self.created_at) as u128;
        let boost = age_boost_secs.max(1) as u128;
        fee.saturating_add(fee.saturating_mul(age) / boost)
    }
}

#[derive(Clone, Debug)]
pub struct PoolPolicy {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub age_boost_secs: u64,
    pub fee_floor: Amount,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 3_600,
            age_boost_secs: 600,
            fee_floor: Amount::from_units(1_000),
        }
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MempoolMetrics {
    pub admitted: u64,
    pub rejected: BTreeMap<String, u64>,
    pub removed: u64,
    pub expired: u64,
}

/// Point-in-time view of the pool for status reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MempoolDiagnostics {
    pub len: usize,
    pub capacity: usize,
    pub senders: usize,
    pub oldest_created_at: Option<UnixTime>,
    pub top_score: Option<u128>,
    pub metrics: MempoolMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub rescored: usize,
}

#[derive(Serialize, Deserialize)]
struct PoolFile {
    v: u32,
    entries: Vec<MempoolEntry>,
}

#[derive(Default)]
struct PoolState {
    // keyed by hash so paging order is stable
    entries: BTreeMap<Hash32, MempoolEntry>,
    fingerprints: HashSet<Fingerprint>,
    metrics: MempoolMetrics,
    dirty: bool,
}

impl PoolState {
    fn insert(&mut self, entry: MempoolEntry) {
        self.fingerprints.insert(entry.tx.fingerprint());
        self.entries.insert(entry.tx.hash, entry);
    }

    fn remove(&mut self, hash: &Hash32) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        self.fingerprints.remove(&entry.tx.fingerprint());
        Some(entry)
    }

    fn reject(&mut self, reason: RejectReason) -> RejectReason {
        *self.metrics.rejected.entry(reason.label().to_string()).or_default() += 1;
        reason
    }
}

pub struct Mempool {
    policy: PoolPolicy,
    confirmed: Arc<dyn ConfirmedIndex>,
    path: Option<PathBuf>,
    state: Mutex<PoolState>,
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("path", &self.path)
            .finish()
    }
}

impl Mempool {
    /// In-memory pool (nothing is written on `flush`).
    pub fn new(policy: PoolPolicy, confirmed: Arc<dyn ConfirmedIndex>) -> Self {
        Self { policy, confirmed, path: None, state: Mutex::new(PoolState::default()) }
    }

    /// Load the durable pool at `path`. Entries confirmed since the last run
    /// are dropped on load.
    pub fn open(
        path: impl AsRef<Path>,
        policy: PoolPolicy,
        confirmed: Arc<dyn ConfirmedIndex>,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pool = Self { policy, confirmed, path: Some(path), state: Mutex::new(PoolState::default()) };
        pool.reload()?;
        Ok(pool)
    }

    fn load_entries(path: &Path) -> io::Result<Vec<MempoolEntry>> {
        let Some(file) = read_json::<PoolFile>(path)? else { return Ok(Vec::new()) };
        if file.v != FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported mempool file version {}", file.v),
            ));
        }
        Ok(file.entries)
    }

    /// Replace the pending entries with what is on disk, then drop whatever
    /// has been confirmed meanwhile. Metrics are kept. A no-op for an
    /// in-memory pool.
    pub fn reload(&self) -> io::Result<usize> {
        let Some(path) = &self.path else { return Ok(self.len()) };
        let entries = Self::load_entries(path)?;
        {
            let mut st = self.state.lock();
            st.entries.clear();
            st.fingerprints.clear();
            for entry in entries {
                st.insert(entry);
            }
            st.dirty = false;
        }
        self.purge_confirmed();
        let pending = self.len();
        debug!(path = %path.display(), pending, "mempool loaded");
        Ok(pending)
    }

    /// Drop entries the confirmed index now covers: same hash, same content,
    /// or a nonce at or below the sender's confirmed nonce.
    pub fn purge_confirmed(&self) -> usize {
        let mut st = self.state.lock();
        let stale: Vec<Hash32> = st
            .entries
            .values()
            .filter(|e| {
                self.confirmed.contains_hash(&e.tx.hash)
                    || self.confirmed.contains_fingerprint(&e.tx.fingerprint())
                    || self.confirmed.max_nonce(&e.tx.from).is_some_and(|n| e.tx.nonce <= n)
            })
            .map(|e| e.tx.hash)
            .collect();
        for h in &stale {
            st.remove(h);
        }
        if !stale.is_empty() {
            st.metrics.removed += stale.len() as u64;
            st.dirty = true;
            debug!(purged = stale.len(), "dropped pending entries superseded by confirmed history");
        }
        stale.len()
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.state.lock().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash32) -> Option<MempoolEntry> {
        self.state.lock().entries.get(hash).cloned()
    }

    /// Run the admission checks and insert on success.
    pub fn admit(&self, tx: Transaction, now: UnixTime) -> Result<Admitted, RejectReason> {
        let mut st = self.state.lock();

        if tx.from == tx.to {
            return Err(st.reject(RejectReason::SelfTransfer));
        }
        if tx.fee < self.policy.fee_floor {
            return Err(st.reject(RejectReason::FeeBelowFloor { fee: tx.fee, floor: self.policy.fee_floor }));
        }
        if st.entries.contains_key(&tx.hash) || self.confirmed.contains_hash(&tx.hash) {
            return Err(st.reject(RejectReason::DuplicateHash));
        }
        let fp = tx.fingerprint();
        if st.fingerprints.contains(&fp) || self.confirmed.contains_fingerprint(&fp) {
            return Err(st.reject(RejectReason::DuplicateContent));
        }
        if let Some(confirmed) = self.confirmed.max_nonce(&tx.from) {
            if tx.nonce <= confirmed {
                return Err(st.reject(RejectReason::StaleNonce { nonce: tx.nonce, confirmed }));
            }
        }
        if st.entries.len() >= self.policy.capacity {
            return Err(st.reject(RejectReason::PoolFull));
        }

        let entry = MempoolEntry {
            priority_score: tx.fee.units(),
            created_at: now,
            expires_at: now.saturating_add(self.policy.ttl_secs),
            tx,
        };
        let admitted = Admitted { hash: entry.tx.hash, priority_score: entry.priority_score };
        st.insert(entry);
        st.metrics.admitted += 1;
        st.dirty = true;
        Ok(admitted)
    }

    /// Best-first iterator over a snapshot of the pool, at most `limit` items.
    /// Ordering: priority desc, created_at asc, hash asc.
    pub fn select_for_block(&self, limit: usize) -> Selection {
        let heap = self
            .state
            .lock()
            .entries
            .values()
            .map(|e| HeapEntry { score: e.priority_score, created_at: e.created_at, tx: e.tx.clone() })
            .collect();
        Selection { heap, remaining: limit }
    }

    /// Drop the given hashes; unknown hashes are ignored. Returns how many were removed.
    pub fn remove(&self, hashes: &[Hash32]) -> usize {
        let mut st = self.state.lock();
        let removed = hashes.iter().filter(|h| st.remove(h).is_some()).count();
        if removed > 0 {
            st.metrics.removed += removed as u64;
            st.dirty = true;
        }
        removed
    }

    /// Drop expired entries and re-derive the remaining priority scores.
    pub fn sweep_expired(&self, now: UnixTime) -> SweepReport {
        let mut st = self.state.lock();
        let expired: Vec<Hash32> = st
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.tx.hash)
            .collect();
        for h in &expired {
            st.remove(h);
        }

        let boost = self.policy.age_boost_secs;
        let mut rescored = 0;
        for entry in st.entries.values_mut() {
            let score = entry.aged_score(now, boost);
            if score != entry.priority_score {
                entry.priority_score = score;
                rescored += 1;
            }
        }

        st.metrics.expired += expired.len() as u64;
        if !expired.is_empty() || rescored > 0 {
            st.dirty = true;
        }
        if !expired.is_empty() {
            info!(expired = expired.len(), remaining = st.entries.len(), "mempool sweep");
        }
        SweepReport { expired: expired.len(), rescored }
    }

    /// Stable listing by hash for the peer query surface. `page` is zero-based.
    pub fn page(&self, page: usize, size: usize) -> Page<MempoolEntry> {
        let st = self.state.lock();
        let size = size.max(1);
        let start = page.saturating_mul(size);
        let records: Vec<MempoolEntry> = st.entries.values().skip(start).take(size).cloned().collect();
        let has_more = st.entries.len() > start.saturating_add(records.len());
        Page { records, has_more }
    }

    pub fn diagnostics(&self) -> MempoolDiagnostics {
        let st = self.state.lock();
        MempoolDiagnostics {
            len: st.entries.len(),
            capacity: self.policy.capacity,
            senders: st.entries.values().map(|e| &e.tx.from).collect::<HashSet<_>>().len(),
            oldest_created_at: st.entries.values().map(|e| e.created_at).min(),
            top_score: st.entries.values().map(|e| e.priority_score).max(),
            metrics: st.metrics.clone(),
        }
    }

    /// Write the pool to disk if it changed since the last flush.
    pub fn flush(&self) -> io::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let mut st = self.state.lock();
        if !st.dirty {
            return Ok(());
        }
        let file = PoolFile { v: FILE_VERSION, entries: st.entries.values().cloned().collect() };
        write_json_atomic(path, &file)?;
        st.dirty = false;
        Ok(())
    }
}

struct HeapEntry {
    score: u128,
    created_at: UnixTime,
    tx: Transaction,
}

impl PartialEq for HeapEntry {
    fn eq(&self, o: &Self) -> bool { self.cmp(o) == Ordering::Equal }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> { Some(self.cmp(o)) }
}
impl Ord for HeapEntry {
    // max-heap: higher score first, then older, then smaller hash
    fn cmp(&self, o: &Self) -> Ordering {
        self.score
            .cmp(&o.score)
            .then_with(|| o.created_at.cmp(&self.created_at))
            .then_with(|| o.tx.hash.cmp(&self.tx.hash))
    }
}

/// Lazy best-first selection returned by [`Mempool::select_for_block`].
pub struct Selection {
    heap: BinaryHeap<HeapEntry>,
    remaining: usize,
}

impl Iterator for Selection {
    type Item = Transaction;

    fn next(&mut self) -> Option<Transaction> {
        if self.remaining == 0 {
            return None;
        }
        let e = self.heap.pop()?;
        self.remaining -= 1;
        Some(e.tx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.min(self.heap.len());
        (n, Some(n))
    }
}
