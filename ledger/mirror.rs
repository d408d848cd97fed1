//! Relational mirror of the ledger.
//!
//! One table per entity, each a map from natural key to a JSON row. Writes
//! apply the changed rows in memory, hand only those rows to the
//! [`TableStore`] backend, and roll the in-memory rows back if the backend
//! refuses them, so the in-memory view always equals what is on the backend.

use crate::storage::{read_json, write_json_atomic};
use crate::types::{Address, Block, Hash32, Height, Transaction, UnixTime};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Blocks,
    Transactions,
    Validators,
    Nodes,
    Staking,
    Contracts,
    NetworkConfig,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Blocks,
        Table::Transactions,
        Table::Validators,
        Table::Nodes,
        Table::Staking,
        Table::Contracts,
        Table::NetworkConfig,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Blocks => "blocks",
            Table::Transactions => "transactions",
            Table::Validators => "validators",
            Table::Nodes => "nodes",
            Table::Staking => "staking",
            Table::Contracts => "contracts",
            Table::NetworkConfig => "network_config",
        }
    }
}

pub type Rows = BTreeMap<String, Value>;

/// Storage backend for mirror tables.
pub trait TableStore: Send + Sync {
    fn load(&self, table: Table) -> io::Result<Rows>;
    /// Persist `changed` rows. `all` is the whole table with them applied,
    /// for backends that rewrite or compact.
    fn store(&mut self, table: Table, changed: &[(String, Value)], all: &Rows) -> io::Result<()>;
}

/// Journal entries tolerated before a table is compacted into its snapshot.
const COMPACT_MIN_ENTRIES: usize = 1_024;

/// `<dir>/<table>.json` snapshot plus an append-only `<dir>/<table>.log`
/// of `[key, row]` lines. Writes append to the log; once the log outgrows
/// the table it is folded into a fresh snapshot.
pub struct FsTables {
    dir: PathBuf,
    log_len: Mutex<HashMap<Table, usize>>,
}

impl FsTables {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), log_len: Mutex::new(HashMap::new()) }
    }

    fn snapshot_path(&self, table: Table) -> PathBuf {
        self.dir.join(format!("{}.json", table.name()))
    }

    fn log_path(&self, table: Table) -> PathBuf {
        self.dir.join(format!("{}.log", table.name()))
    }

    fn compact(&self, table: Table, all: &Rows) -> io::Result<()> {
        write_json_atomic(&self.snapshot_path(table), all)?;
        match fs::remove_file(self.log_path(table)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.log_len.lock().insert(table, 0);
        debug!(table = table.name(), rows = all.len(), "mirror table compacted");
        Ok(())
    }
}

impl TableStore for FsTables {
    fn load(&self, table: Table) -> io::Result<Rows> {
        let mut rows: Rows = read_json(&self.snapshot_path(table))?.unwrap_or_default();
        let path = self.log_path(table);
        let mut entries = 0;
        if path.exists() {
            let lines: Vec<String> = BufReader::new(fs::File::open(&path)?).lines().collect::<io::Result<_>>()?;
            let last = lines.len().saturating_sub(1);
            for (i, line) in lines.iter().enumerate() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<(String, Value)>(line) {
                    Ok((k, v)) => {
                        rows.insert(k, v);
                        entries += 1;
                    }
                    // a crash mid-append leaves at most the last line short
                    Err(e) if i == last => {
                        warn!(table = table.name(), error = %e, "ignoring torn mirror journal line");
                    }
                    Err(e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{} line {}: {e}", path.display(), i + 1),
                        ))
                    }
                }
            }
        }
        self.log_len.lock().insert(table, entries);
        Ok(rows)
    }

    fn store(&mut self, table: Table, changed: &[(String, Value)], all: &Rows) -> io::Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let pending = self.log_len.lock().get(&table).copied().unwrap_or(0) + changed.len();
        if pending > COMPACT_MIN_ENTRIES.max(all.len()) {
            return self.compact(table, all);
        }
        fs::create_dir_all(&self.dir)?;
        let mut buf = Vec::new();
        for entry in changed {
            serde_json::to_writer(&mut buf, entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            buf.push(b'\n');
        }
        let mut f = OpenOptions::new().create(true).append(true).open(self.log_path(table))?;
        f.write_all(&buf)?;
        f.sync_data()?;
        self.log_len.lock().insert(table, pending);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemTables {
    tables: HashMap<Table, Rows>,
}

impl TableStore for MemTables {
    fn load(&self, table: Table) -> io::Result<Rows> {
        Ok(self.tables.get(&table).cloned().unwrap_or_default())
    }

    fn store(&mut self, table: Table, changed: &[(String, Value)], _all: &Rows) -> io::Result<()> {
        let rows = self.tables.entry(table).or_default();
        for (k, v) in changed {
            rows.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

/// Block row: header fields plus the hashes of the included transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub height: Height,
    pub hash: Hash32,
    pub previous_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: UnixTime,
    pub creator: Address,
    pub tx_count: u32,
    #[serde(with = "crate::types::hex_bytes")]
    pub signature: Vec<u8>,
    pub tx_hashes: Vec<Hash32>,
}

impl From<&Block> for BlockRow {
    fn from(b: &Block) -> Self {
        Self {
            height: b.header.height,
            hash: b.hash,
            previous_hash: b.header.previous_hash,
            merkle_root: b.header.merkle_root,
            timestamp: b.header.timestamp,
            creator: b.header.creator.clone(),
            tx_count: b.header.tx_count,
            signature: b.signature.clone(),
            tx_hashes: b.tx_hashes(),
        }
    }
}

pub fn block_key(height: Height) -> String {
    format!("{height:020}")
}

pub fn tx_key(hash: &Hash32) -> String {
    hash.to_hex()
}

pub const NETWORK_CONFIG_KEY: &str = "current";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorDelta {
    pub blocks_added: usize,
    pub txs_added: usize,
}

fn to_value<T: Serialize>(v: &T) -> io::Result<Value> {
    serde_json::to_value(v).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub struct Mirror {
    backend: Box<dyn TableStore>,
    tables: HashMap<Table, Rows>,
    // secondary index: sender -> confirmed tx hashes
    by_sender: HashMap<Address, BTreeSet<Hash32>>,
}

impl Mirror {
    pub fn open(backend: Box<dyn TableStore>) -> io::Result<Self> {
        let mut m = Self { backend, tables: HashMap::new(), by_sender: HashMap::new() };
        m.reload()?;
        Ok(m)
    }

    /// Re-read every table from the backend, picking up writes made by
    /// another handle on the same store.
    pub fn reload(&mut self) -> io::Result<()> {
        let mut tables = HashMap::new();
        for t in Table::ALL {
            tables.insert(t, self.backend.load(t)?);
        }
        self.tables = tables;
        self.by_sender.clear();
        let rows: Vec<Value> = self.table(Table::Transactions).values().cloned().collect();
        self.index_senders(rows.iter());
        Ok(())
    }

    fn index_senders<'v>(&mut self, rows: impl Iterator<Item = &'v Value>) {
        for v in rows {
            if let Ok(tx) = serde_json::from_value::<Transaction>(v.clone()) {
                self.by_sender.entry(tx.from).or_default().insert(tx.hash);
            }
        }
    }

    fn table(&self, table: Table) -> &Rows {
        // every table is loaded in `open`
        static EMPTY: Rows = BTreeMap::new();
        self.tables.get(&table).unwrap_or(&EMPTY)
    }

    pub fn len(&self, table: Table) -> usize {
        self.table(table).len()
    }

    pub fn contains(&self, table: Table, key: &str) -> bool {
        self.table(table).contains_key(key)
    }

    pub fn get(&self, table: Table, key: &str) -> Option<&Value> {
        self.table(table).get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, table: Table, key: &str) -> Option<T> {
        self.get(table, key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Rows in key order.
    pub fn rows(&self, table: Table) -> impl Iterator<Item = (&String, &Value)> {
        self.table(table).iter()
    }

    pub fn rows_as<'a, T: DeserializeOwned + 'a>(&'a self, table: Table) -> impl Iterator<Item = T> + 'a {
        self.rows(table).filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
    }

    /// Apply the rows that change `table`, persist exactly those, and undo
    /// them in memory when the backend fails. Returns how many changed.
    fn write(&mut self, table: Table, rows: Vec<(String, Value)>, replace: bool) -> io::Result<usize> {
        let live = self.tables.entry(table).or_default();
        let mut seen = HashSet::new();
        let mut changed = Vec::new();
        let mut undo = Vec::new();
        for (k, v) in rows {
            if !seen.insert(k.clone()) {
                continue;
            }
            let apply = match live.get(&k) {
                None => true,
                Some(old) => replace && *old != v,
            };
            if apply {
                undo.push((k.clone(), live.insert(k.clone(), v.clone())));
                changed.push((k, v));
            }
        }
        if changed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.backend.store(table, &changed, live) {
            for (k, old) in undo.into_iter().rev() {
                match old {
                    Some(v) => live.insert(k, v),
                    None => live.remove(&k),
                };
            }
            return Err(e);
        }
        if table == Table::Transactions {
            self.index_senders(changed.iter().map(|(_, v)| v));
        }
        Ok(changed.len())
    }

    /// Insert rows whose key is not present yet. Returns how many were added.
    pub fn insert_if_absent(&mut self, table: Table, rows: Vec<(String, Value)>) -> io::Result<usize> {
        self.write(table, rows, false)
    }

    /// Insert or replace rows (mutable local state such as validator counters).
    pub fn upsert(&mut self, table: Table, rows: Vec<(String, Value)>) -> io::Result<usize> {
        self.write(table, rows, true)
    }

    /// Mirror one block: block row first, then its transaction rows.
    pub fn apply_block(&mut self, block: &Block) -> io::Result<MirrorDelta> {
        let blocks_added =
            self.insert_if_absent(Table::Blocks, vec![(block_key(block.height()), to_value(&BlockRow::from(block))?)])?;
        let tx_rows = block
            .transactions
            .iter()
            .map(|tx| Ok((tx_key(&tx.hash), to_value(tx)?)))
            .collect::<io::Result<Vec<_>>>()?;
        let txs_added = self.insert_if_absent(Table::Transactions, tx_rows)?;
        Ok(MirrorDelta { blocks_added, txs_added })
    }

    pub fn transactions_by_sender(&self, from: &Address) -> Vec<Transaction> {
        self.by_sender
            .get(from)
            .into_iter()
            .flatten()
            .filter_map(|h| self.get_as(Table::Transactions, &tx_key(h)))
            .collect()
    }
}
