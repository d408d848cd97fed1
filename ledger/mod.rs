//! Dual-write ledger persistence.
//!
//! A block is written to the append-only binary ledger first and then to the
//! relational mirror. It is durable only when both succeed; if the mirror
//! write fails the caller gets `PartialCommit` and a later [`Ledger::reconcile`]
//! replays the binary ledger into the mirror. The binary file is never
//! rewritten by reconciliation.

pub mod binary;
pub mod index;
pub mod mirror;

use crate::consensus::{Validator, ValidatorSet};
use crate::merkle::merkle_root;
use crate::storage::DataDir;
use crate::types::{
    Address, Block, BlockHeader, Hash32, Height, NetworkConfig, Page, PeerNode, Transaction, UnixTime,
    GENESIS_PREVIOUS_HASH,
};
use binary::BinaryLedger;
use index::SharedIndex;
use lru::LruCache;
use mirror::{block_key, tx_key, FsTables, Mirror, Table, TableStore, NETWORK_CONFIG_KEY};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use mirror::{BlockRow, MirrorDelta};

const DEFAULT_CACHE_BLOCKS: usize = 256;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("block {height} is in the binary ledger but the mirror write failed: {source}")]
    PartialCommit {
        height: Height,
        hash: Hash32,
        #[source]
        source: io::Error,
    },
    #[error("ledger corrupt: {0}")]
    Corrupt(String),
    #[error("not a ledger file (bad magic)")]
    BadMagic,
    #[error("unsupported ledger version {0}")]
    UnsupportedVersion(u32),
    #[error("block height {got} does not follow tip (expected {expected})")]
    NotNextHeight { expected: Height, got: Height },
    #[error("block {height} previous hash {got} does not match tip {expected}")]
    Linkage { height: Height, expected: Hash32, got: Hash32 },
    #[error("ledger file moved on: this handle knows {known} blocks, disk has {on_disk}")]
    Stale { known: u32, on_disk: u32 },
    #[error("genesis already exists")]
    GenesisExists,
    #[error("ledger has no genesis block")]
    NoGenesis,
    #[error("encode: {0}")]
    Encode(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub height: Height,
    pub hash: Hash32,
    pub tx_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub blocks_scanned: usize,
    pub blocks_added: usize,
    pub txs_added: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainReport {
    pub blocks: usize,
    pub tip_height: Option<Height>,
    pub tip_hash: Option<Hash32>,
    pub mirror_missing_blocks: usize,
    pub mirror_missing_txs: usize,
    pub problems: Vec<String>,
}

impl ChainReport {
    pub fn ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Everything needed to create block 0.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub creator: Address,
    pub timestamp: UnixTime,
    pub network: NetworkConfig,
    pub validators: Vec<Validator>,
}

pub struct Ledger {
    binary: BinaryLedger,
    mirror: Mirror,
    index: Arc<SharedIndex>,
    hashes: Vec<Hash32>,
    by_hash: HashMap<Hash32, Height>,
    tip: Option<BlockHeader>,
    cache: Mutex<LruCache<Height, Block>>,
}

impl Ledger {
    /// Open the ledger under a data directory with the filesystem mirror.
    pub fn open(dir: &DataDir, cache_blocks: usize, now: UnixTime) -> Result<Self, PersistenceError> {
        let backend = Box::new(FsTables::new(dir.mirror_dir()));
        Self::open_with(dir.ledger_path(), backend, cache_blocks, now)
    }

    pub fn open_with(
        ledger_path: impl AsRef<Path>,
        backend: Box<dyn TableStore>,
        cache_blocks: usize,
        now: UnixTime,
    ) -> Result<Self, PersistenceError> {
        let binary = BinaryLedger::open(ledger_path, now)?;
        let mirror = Mirror::open(backend)?;
        let blocks = binary.read_all()?;

        let mut hashes = Vec::with_capacity(blocks.len());
        let mut by_hash = HashMap::with_capacity(blocks.len());
        for (i, b) in blocks.iter().enumerate() {
            if b.height() != i as Height {
                return Err(PersistenceError::Corrupt(format!(
                    "record {i} holds block height {}",
                    b.height()
                )));
            }
            hashes.push(b.hash);
            by_hash.insert(b.hash, b.height());
        }
        let index = Arc::new(SharedIndex::from_blocks(&blocks));
        let tip = blocks.last().map(|b| b.header.clone());

        let cap = NonZeroUsize::new(cache_blocks.max(1)).unwrap_or(NonZeroUsize::MIN);
        let mut cache = LruCache::new(cap);
        for b in blocks.into_iter().rev().take(cap.get()) {
            cache.put(b.height(), b);
        }

        Ok(Self { binary, mirror, index, hashes, by_hash, tip, cache: Mutex::new(cache) })
    }

    pub fn default_cache_blocks() -> usize {
        DEFAULT_CACHE_BLOCKS
    }

    /// Confirmed-transaction view shared with the mempool.
    pub fn confirmed_index(&self) -> Arc<SharedIndex> {
        Arc::clone(&self.index)
    }

    pub fn height(&self) -> Option<Height> {
        self.tip.as_ref().map(|h| h.height)
    }

    pub fn tip_header(&self) -> Option<&BlockHeader> {
        self.tip.as_ref()
    }

    pub fn tip_hash(&self) -> Option<Hash32> {
        self.hashes.last().copied()
    }

    pub fn block_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn block_hashes(&self) -> &[Hash32] {
        &self.hashes
    }

    pub fn tx_count(&self) -> usize {
        self.index.tx_count()
    }

    fn check_extends(&self, block: &Block) -> Result<(), PersistenceError> {
        let (expected_height, expected_prev) = match &self.tip {
            None => (0, GENESIS_PREVIOUS_HASH),
            Some(tip) => (tip.height + 1, self.tip_hash().unwrap_or_default()),
        };
        if block.height() != expected_height {
            return Err(PersistenceError::NotNextHeight { expected: expected_height, got: block.height() });
        }
        if *block.previous_hash() != expected_prev {
            return Err(PersistenceError::Linkage {
                height: block.height(),
                expected: expected_prev,
                got: *block.previous_hash(),
            });
        }
        Ok(())
    }

    /// Catch up with blocks and mirror rows written through another handle
    /// on the same data directory. Returns the number of new blocks.
    pub fn refresh(&mut self) -> Result<usize, PersistenceError> {
        let known = self.binary.len();
        let added = self.binary.refresh()?;
        for i in known..known + added {
            let Some(block) = self.binary.read(i)? else { break };
            self.check_extends(&block)?;
            self.index.add_block(&block);
            self.hashes.push(block.hash);
            self.by_hash.insert(block.hash, block.height());
            self.tip = Some(block.header.clone());
            self.cache.lock().put(block.height(), block);
        }
        self.mirror.reload()?;
        if added > 0 {
            debug!(added, height = ?self.height(), "ledger refreshed from disk");
        }
        Ok(added)
    }

    /// Binary tier, confirmed index, then mirror.
    pub fn commit(&mut self, block: &Block) -> Result<CommitReceipt, PersistenceError> {
        self.check_extends(block)?;
        self.binary.append(block)?;

        self.index.add_block(block);
        self.hashes.push(block.hash);
        self.by_hash.insert(block.hash, block.height());
        self.tip = Some(block.header.clone());
        self.cache.lock().put(block.height(), block.clone());

        let receipt = CommitReceipt { height: block.height(), hash: block.hash, tx_count: block.transactions.len() };
        if let Err(source) = self.mirror.apply_block(block) {
            warn!(height = block.height(), hash = %block.hash, error = %source, "mirror write failed; reconcile required");
            return Err(PersistenceError::PartialCommit { height: block.height(), hash: block.hash, source });
        }
        info!(height = receipt.height, hash = %receipt.hash, txs = receipt.tx_count, "block committed");
        Ok(receipt)
    }

    /// Create block 0 together with the network config and initial validators.
    pub fn init_genesis(&mut self, params: GenesisParams) -> Result<Block, PersistenceError> {
        if self.tip.is_some() {
            return Err(PersistenceError::GenesisExists);
        }
        let header = BlockHeader {
            height: 0,
            previous_hash: GENESIS_PREVIOUS_HASH,
            merkle_root: merkle_root(&[]),
            timestamp: params.timestamp,
            creator: params.creator,
            tx_count: 0,
        };
        let block = Block { hash: header.hash(), header, signature: Vec::new(), transactions: Vec::new() };
        self.commit(&block)?;

        let mut network = params.network;
        network.genesis_hash = block.hash;
        self.set_network_config(&network)?;
        self.save_validators(&ValidatorSet::new(params.validators))?;
        info!(hash = %block.hash, chain_id = network.chain_id, "genesis created");
        Ok(block)
    }

    /// Replay the binary ledger into the mirror, inserting missing rows only.
    pub fn reconcile(&mut self) -> Result<ReconcileReport, PersistenceError> {
        let mut report = ReconcileReport::default();
        for block in self.binary.read_all()? {
            let d = self.mirror.apply_block(&block)?;
            report.blocks_scanned += 1;
            report.blocks_added += d.blocks_added;
            report.txs_added += d.txs_added;
        }
        if report.blocks_added + report.txs_added > 0 {
            info!(added_blocks = report.blocks_added, added_txs = report.txs_added, "mirror reconciled");
        }
        Ok(report)
    }

    /// Re-read the binary ledger and check every block's integrity and
    /// linkage, plus mirror coverage.
    pub fn verify_chain(&self) -> Result<ChainReport, PersistenceError> {
        let blocks = self.binary.read_all()?;
        let mut report = ChainReport { blocks: blocks.len(), ..Default::default() };
        let mut prev = GENESIS_PREVIOUS_HASH;
        for (i, b) in blocks.iter().enumerate() {
            let h = b.height();
            if h != i as Height {
                report.problems.push(format!("record {i}: height {h}"));
            }
            if b.header.previous_hash != prev {
                report.problems.push(format!("block {h}: previous hash does not link"));
            }
            if b.header.hash() != b.hash {
                report.problems.push(format!("block {h}: hash does not match header"));
            }
            if merkle_root(&b.tx_hashes()) != b.header.merkle_root {
                report.problems.push(format!("block {h}: merkle root mismatch"));
            }
            if b.header.tx_count as usize != b.transactions.len() {
                report.problems.push(format!("block {h}: tx_count mismatch"));
            }
            if !self.mirror.contains(Table::Blocks, &block_key(h)) {
                report.mirror_missing_blocks += 1;
            }
            report.mirror_missing_txs += b
                .transactions
                .iter()
                .filter(|t| !self.mirror.contains(Table::Transactions, &tx_key(&t.hash)))
                .count();
            prev = b.hash;
        }
        report.tip_height = blocks.last().map(|b| b.height());
        report.tip_hash = blocks.last().map(|b| b.hash);
        Ok(report)
    }

    pub fn block(&self, height: Height) -> Result<Option<Block>, PersistenceError> {
        if let Some(b) = self.cache.lock().get(&height) {
            return Ok(Some(b.clone()));
        }
        let Ok(i) = usize::try_from(height) else { return Ok(None) };
        let block = self.binary.read(i)?;
        if let Some(b) = &block {
            self.cache.lock().put(height, b.clone());
        }
        Ok(block)
    }

    pub fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, PersistenceError> {
        match self.by_hash.get(hash) {
            Some(h) => self.block(*h),
            None => Ok(None),
        }
    }

    /// Blocks starting at `from_height`, at most `limit`.
    pub fn blocks_from(&self, from_height: Height, limit: usize) -> Result<Page<Block>, PersistenceError> {
        let end = self.height().map_or(0, |h| h + 1);
        let mut records = Vec::new();
        let mut h = from_height;
        while h < end && records.len() < limit {
            if let Some(b) = self.block(h)? {
                records.push(b);
            }
            h += 1;
        }
        Ok(Page { records, has_more: h < end })
    }

    pub fn transaction(&self, hash: &Hash32) -> Option<Transaction> {
        self.mirror.get_as(Table::Transactions, &tx_key(hash))
    }

    pub fn transactions_by_sender(&self, from: &Address) -> Vec<Transaction> {
        self.mirror.transactions_by_sender(from)
    }

    /// Zero-based page of mirror rows in key order.
    pub fn table_page(&self, table: Table, page: usize, size: usize) -> Page<Value> {
        let size = size.max(1);
        let start = page.saturating_mul(size);
        let records: Vec<Value> = self.mirror.rows(table).skip(start).take(size).map(|(_, v)| v.clone()).collect();
        let has_more = self.mirror.len(table) > start.saturating_add(records.len());
        Page { records, has_more }
    }

    pub fn mirror_len(&self, table: Table) -> usize {
        self.mirror.len(table)
    }

    pub fn validators(&self) -> ValidatorSet {
        ValidatorSet::new(self.mirror.rows_as::<Validator>(Table::Validators).collect())
    }

    pub fn save_validators(&mut self, set: &ValidatorSet) -> Result<usize, PersistenceError> {
        let rows = set
            .validators()
            .iter()
            .map(|v| Ok((v.address.to_string(), to_value(v)?)))
            .collect::<Result<Vec<_>, PersistenceError>>()?;
        Ok(self.mirror.upsert(Table::Validators, rows)?)
    }

    /// Add validators not known yet (peer merge).
    pub fn merge_validators(&mut self, vals: Vec<Validator>) -> Result<usize, PersistenceError> {
        let rows = vals
            .iter()
            .map(|v| Ok((v.address.to_string(), to_value(v)?)))
            .collect::<Result<Vec<_>, PersistenceError>>()?;
        Ok(self.mirror.insert_if_absent(Table::Validators, rows)?)
    }

    pub fn network_config(&self) -> Option<NetworkConfig> {
        self.mirror.get_as(Table::NetworkConfig, NETWORK_CONFIG_KEY)
    }

    pub fn set_network_config(&mut self, cfg: &NetworkConfig) -> Result<(), PersistenceError> {
        self.mirror.upsert(Table::NetworkConfig, vec![(NETWORK_CONFIG_KEY.to_string(), to_value(cfg)?)])?;
        Ok(())
    }

    pub fn nodes(&self) -> Vec<PeerNode> {
        self.mirror.rows_as(Table::Nodes).collect()
    }

    pub fn node(&self, node_id: &str) -> Option<PeerNode> {
        self.mirror.get_as(Table::Nodes, node_id)
    }

    pub fn upsert_nodes(&mut self, nodes: &[PeerNode]) -> Result<usize, PersistenceError> {
        let rows = nodes
            .iter()
            .map(|n| Ok((n.node_id.clone(), to_value(n)?)))
            .collect::<Result<Vec<_>, PersistenceError>>()?;
        Ok(self.mirror.upsert(Table::Nodes, rows)?)
    }

    /// Insert-if-absent for opaque synced rows keyed by `key_field`.
    pub fn merge_rows(&mut self, table: Table, key_field: &str, rows: Vec<Value>) -> Result<usize, PersistenceError> {
        let keyed = rows
            .into_iter()
            .filter_map(|v| {
                let key = match v.get(key_field)? {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((key, v))
            })
            .collect();
        Ok(self.mirror.insert_if_absent(table, keyed)?)
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, PersistenceError> {
    serde_json::to_value(v).map_err(|e| PersistenceError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;

    fn network() -> NetworkConfig {
        NetworkConfig {
            chain_id: 7,
            network_name: "testnet".into(),
            genesis_hash: Hash32::zero(),
            fee_floor: Amount::from_units(1_000),
            max_txs_per_block: 100,
            reward_rate_bps: 0,
        }
    }

    fn genesis_params() -> GenesisParams {
        GenesisParams { creator: Address::from_bytes([1; 20]), timestamp: 1_000, network: network(), validators: vec![] }
    }

    fn child(parent: &Block) -> Block {
        let header = BlockHeader {
            height: parent.height() + 1,
            previous_hash: parent.hash,
            merkle_root: merkle_root(&[]),
            timestamp: parent.header.timestamp + 1,
            creator: Address::from_bytes([1; 20]),
            tx_count: 0,
        };
        Block { hash: header.hash(), header, signature: vec![], transactions: vec![] }
    }

    #[test]
    fn genesis_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut l = Ledger::open(&data, 8, 0).unwrap();
        let g = l.init_genesis(genesis_params()).unwrap();
        assert_eq!(g.header.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(l.network_config().unwrap().genesis_hash, g.hash);
        assert!(matches!(l.init_genesis(genesis_params()), Err(PersistenceError::GenesisExists)));
    }

    #[test]
    fn rejects_unlinked_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::open(&DataDir::new(dir.path()), 8, 0).unwrap();
        let g = l.init_genesis(genesis_params()).unwrap();
        let b1 = child(&g);

        let mut skip = child(&b1);
        skip.header.height = 5;
        assert!(matches!(l.commit(&skip), Err(PersistenceError::NotNextHeight { expected: 1, got: 5 })));

        let mut forked = b1.clone();
        forked.header.previous_hash = Hash32([3; 32]);
        assert!(matches!(l.commit(&forked), Err(PersistenceError::Linkage { .. })));

        l.commit(&b1).unwrap();
        assert_eq!(l.height(), Some(1));
    }

    #[test]
    fn reopen_restores_tip_and_cache_misses_hit_disk() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut last;
        {
            let mut l = Ledger::open(&data, 2, 0).unwrap();
            last = l.init_genesis(genesis_params()).unwrap();
            for _ in 0..4 {
                let b = child(&last);
                l.commit(&b).unwrap();
                last = b;
            }
        }
        let l = Ledger::open(&data, 2, 0).unwrap();
        assert_eq!(l.height(), Some(4));
        assert_eq!(l.tip_hash(), Some(last.hash));
        assert_eq!(l.block(0).unwrap().unwrap().height(), 0);
        assert_eq!(l.block_by_hash(&last.hash).unwrap().unwrap(), last);
        let report = l.verify_chain().unwrap();
        assert!(report.ok(), "{:?}", report.problems);
        assert_eq!(report.blocks, 5);

        let page = l.blocks_from(3, 10).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(!page.has_more);
    }

    #[test]
    fn ledger_can_be_shared_across_threads() {
        fn shared<T: Send + Sync>() {}
        shared::<Ledger>();
        shared::<crate::sync::LedgerPeer>();

        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::open(&DataDir::new(dir.path()), 8, 0).unwrap();
        l.init_genesis(genesis_params()).unwrap();
        let l = Arc::new(parking_lot::RwLock::new(l));
        let reader = Arc::clone(&l);
        let h = std::thread::spawn(move || reader.read().height());
        assert_eq!(h.join().unwrap(), Some(0));
    }

    #[test]
    fn refresh_follows_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut writer = Ledger::open(&data, 8, 0).unwrap();
        let mut follower = Ledger::open(&data, 8, 0).unwrap();
        let g = writer.init_genesis(genesis_params()).unwrap();
        let b1 = child(&g);
        writer.commit(&b1).unwrap();

        assert!(matches!(follower.commit(&g), Err(PersistenceError::Stale { known: 0, on_disk: 2 })));
        assert_eq!(follower.refresh().unwrap(), 2);
        assert_eq!(follower.tip_hash(), Some(b1.hash));
        assert_eq!(follower.network_config().unwrap().genesis_hash, g.hash);
        assert_eq!(follower.mirror_len(Table::Blocks), 2);
        follower.commit(&child(&b1)).unwrap();
        assert_eq!(writer.refresh().unwrap(), 1);
        assert_eq!(writer.height(), Some(2));
    }

    #[test]
    fn table_paging() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = Ledger::open(&DataDir::new(dir.path()), 8, 0).unwrap();
        l.init_genesis(genesis_params()).unwrap();
        let page = l.table_page(Table::Blocks, 0, 10);
        assert_eq!(page.records.len(), 1);
        assert!(!page.has_more);
        assert_eq!(l.table_page(Table::Blocks, 1, 10).records.len(), 0);
    }
}
