//! Pull synchronization.
//!
//! A full pass walks a fixed phase sequence against the best reachable peer.
//! Each completed phase is recorded in `sync_state.json`; an interrupted or
//! failed pass resumes at the first incomplete phase on the next run, and
//! the marker is cleared once every phase has completed.

use super::entity::EntityKind;
use super::nodes::RemoteNode;
use super::peer::{NetworkError, PeerClient, PeerStatus};
use super::select::{probe_all, rank, ChainIdentity, PeerProbe, SelectionStrategy};
use crate::consensus::{validate_block, ChainStore, Validator};
use crate::crypto::ed25519::Ed25519Verifier;
use crate::ledger::mirror::Table;
use crate::ledger::{Ledger, PersistenceError};
use crate::mempool::Mempool;
use crate::storage::{read_json, write_json_atomic};
use crate::types::{Block, NetworkConfig, Transaction, TxStatus, UnixTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

const STATE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Genesis,
    NetworkConfig,
    NodesAndValidators,
    Blocks,
    Transactions,
    ContractsAndStaking,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 6] = [
        SyncPhase::Genesis,
        SyncPhase::NetworkConfig,
        SyncPhase::NodesAndValidators,
        SyncPhase::Blocks,
        SyncPhase::Transactions,
        SyncPhase::ContractsAndStaking,
    ];

    pub fn entities(self) -> &'static [EntityKind] {
        match self {
            SyncPhase::Genesis | SyncPhase::Blocks => &[EntityKind::Blocks],
            SyncPhase::NetworkConfig => &[EntityKind::NetworkConfig],
            SyncPhase::NodesAndValidators => &[EntityKind::Nodes, EntityKind::Validators],
            SyncPhase::Transactions => &[EntityKind::Transactions, EntityKind::Mempool],
            SyncPhase::ContractsAndStaking => &[EntityKind::Contracts, EntityKind::Staking],
        }
    }
}

/// Resume marker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub v: u32,
    pub completed: Vec<SyncPhase>,
    pub peer: Option<String>,
    pub updated_at: UnixTime,
}

impl SyncState {
    pub fn load(path: &PathBuf) -> io::Result<Self> {
        match read_json::<SyncState>(path)? {
            Some(s) if s.v == STATE_VERSION => Ok(s),
            Some(s) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported sync state version {}", s.v),
            )),
            None => Ok(Self { v: STATE_VERSION, ..Default::default() }),
        }
    }

    /// First phase not yet completed.
    pub fn next_phase(&self) -> Option<SyncPhase> {
        SyncPhase::ALL.into_iter().find(|p| !self.completed.contains(p))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancel,
}

/// Reported after every page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub phase: SyncPhase,
    pub entity: EntityKind,
    pub page: usize,
    /// Records received for `entity` so far in this run.
    pub synced: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub fetched: u64,
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncReport {
    pub peer: Option<String>,
    pub probes: Vec<PeerProbe>,
    pub resumed_from: Option<SyncPhase>,
    pub completed: Vec<SyncPhase>,
    pub entities: BTreeMap<EntityKind, EntityStats>,
    pub partial_commits: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub height_before: Option<u64>,
    pub height_after: Option<u64>,
    pub elapsed_ms: u64,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        SyncPhase::ALL.iter().all(|p| self.completed.contains(p))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no reachable peer on this network ({probed} probed)")]
    NoReachablePeers { probed: usize },
    #[error("{0} is local-only and never synchronized")]
    LocalOnly(EntityKind),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Why a phase stopped against one peer.
enum PhaseError {
    /// Try the next peer.
    Network(NetworkError),
    /// Peer sent data we refuse; try the next peer.
    Rejected(String),
    /// Abort the run.
    Fatal(SyncError),
}

impl From<PersistenceError> for PhaseError {
    fn from(e: PersistenceError) -> Self {
        PhaseError::Fatal(e.into())
    }
}

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub page_size: usize,
    pub strategy: SelectionStrategy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { page_size: 100, strategy: SelectionStrategy::default() }
    }
}

pub struct SyncManager<'a> {
    ledger: &'a mut Ledger,
    mempool: &'a Mempool,
    state_path: PathBuf,
    opts: SyncOptions,
}

impl<'a> SyncManager<'a> {
    pub fn new(ledger: &'a mut Ledger, mempool: &'a Mempool, state_path: impl Into<PathBuf>, opts: SyncOptions) -> Self {
        Self { ledger, mempool, state_path: state_path.into(), opts }
    }

    /// One full synchronization pass. Per-record and per-peer failures are
    /// collected in the report; only local corruption and I/O abort.
    pub fn run(
        &mut self,
        peers: &[Box<dyn PeerClient>],
        now: UnixTime,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let identity = ChainIdentity {
            chain_id: self.ledger.network_config().map(|n| n.chain_id),
            genesis_hash: self.ledger.block_hashes().first().copied(),
        };
        let probes = {
            let ledger = &*self.ledger;
            probe_all(peers, &identity, |id| ledger.node(id).map_or(0, |n| n.reputation_score))
        };
        let candidates: Vec<(usize, PeerStatus)> = rank(&probes, self.opts.strategy)
            .into_iter()
            .filter_map(|p| Some((p.index, p.status.clone()?)))
            .collect();

        let mut report = SyncReport { probes, height_before: self.ledger.height(), ..Default::default() };
        if candidates.is_empty() {
            return Err(SyncError::NoReachablePeers { probed: peers.len() });
        }

        let mut state = SyncState::load(&self.state_path)?;
        if !state.completed.is_empty() {
            report.resumed_from = state.next_phase();
            info!(phase = ?report.resumed_from, "resuming sync");
        }
        report.completed = state.completed.clone();

        let mut cursor = 0;
        'phases: for phase in SyncPhase::ALL {
            if state.completed.contains(&phase) {
                continue;
            }
            loop {
                let (index, status) = &candidates[cursor];
                let peer = peers[*index].as_ref();
                report.peer = Some(peer.id().to_string());
                match self.run_phase(phase, peer, status, now, &mut report, progress) {
                    Ok(true) => {
                        state.completed.push(phase);
                        state.peer = Some(peer.id().to_string());
                        state.updated_at = now;
                        write_json_atomic(&self.state_path, &state)?;
                        report.completed.push(phase);
                        info!(?phase, peer = peer.id(), "sync phase complete");
                        break;
                    }
                    Ok(false) => {
                        report.cancelled = true;
                        info!(?phase, "sync cancelled");
                        break 'phases;
                    }
                    Err(PhaseError::Fatal(e)) => return Err(e),
                    Err(PhaseError::Network(e)) => {
                        warn!(?phase, peer = peer.id(), error = %e, "peer failed during sync");
                        report.errors.push(format!("{phase:?}: {e}"));
                    }
                    Err(PhaseError::Rejected(msg)) => {
                        warn!(?phase, peer = peer.id(), reason = %msg, "peer data rejected");
                        report.errors.push(format!("{phase:?}: {} sent {msg}", peer.id()));
                    }
                }
                cursor += 1;
                if cursor >= candidates.len() {
                    report.errors.push(format!("{phase:?}: no peer could complete the phase"));
                    break 'phases;
                }
            }
        }

        if report.partial_commits > 0 {
            match self.ledger.reconcile() {
                Ok(r) => info!(blocks = r.blocks_added, txs = r.txs_added, "mirror reconciled after sync"),
                Err(e) => report.errors.push(format!("reconcile: {e}")),
            }
        }
        self.mempool.flush()?;
        if report.is_complete() {
            match std::fs::remove_file(&self.state_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        report.height_after = self.ledger.height();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            peer = report.peer.as_deref().unwrap_or("-"),
            height = ?report.height_after,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            ms = report.elapsed_ms,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Ok(true): phase done. Ok(false): cancelled between pages.
    fn run_phase(
        &mut self,
        phase: SyncPhase,
        peer: &dyn PeerClient,
        status: &PeerStatus,
        now: UnixTime,
        report: &mut SyncReport,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<bool, PhaseError> {
        for &entity in phase.entities() {
            if !entity.is_syncable() {
                return Err(PhaseError::Fatal(SyncError::LocalOnly(entity)));
            }
        }
        match phase {
            SyncPhase::Genesis => self.pull_genesis(peer, status, report, progress).map(|_| true),
            SyncPhase::NetworkConfig => self.pull_network_config(peer, status, report, progress).map(|_| true),
            SyncPhase::Blocks => self.pull_blocks(peer, report, progress),
            _ => {
                for &entity in phase.entities() {
                    if !self.pull_pages(phase, entity, peer, now, report, progress)? {
                        return Ok(false);
                    }
                }
                if phase == SyncPhase::Transactions {
                    self.mempool.flush().map_err(|e| PhaseError::Fatal(e.into()))?;
                }
                Ok(true)
            }
        }
    }

    fn pull_genesis(
        &mut self,
        peer: &dyn PeerClient,
        status: &PeerStatus,
        report: &mut SyncReport,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<(), PhaseError> {
        if self.ledger.height().is_some() {
            return Ok(());
        }
        let page = peer.page(EntityKind::Blocks, 0, 1).map_err(PhaseError::Network)?;
        let value = page.records.into_iter().next().ok_or_else(|| PhaseError::Rejected("no genesis block".into()))?;
        let block: Block = serde_json::from_value(value).map_err(|e| PhaseError::Rejected(format!("genesis: {e}")))?;
        if Some(block.hash) != status.genesis_hash {
            return Err(PhaseError::Rejected("genesis does not match advertised hash".into()));
        }
        self.commit_synced(&block, report)?;
        let stats = report.entities.entry(EntityKind::Blocks).or_default();
        stats.fetched += 1;
        stats.inserted += 1;
        let synced = stats.fetched;
        progress(&Progress { phase: SyncPhase::Genesis, entity: EntityKind::Blocks, page: 0, synced });
        Ok(())
    }

    fn pull_network_config(
        &mut self,
        peer: &dyn PeerClient,
        status: &PeerStatus,
        report: &mut SyncReport,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<(), PhaseError> {
        let cfg = match &status.network {
            Some(cfg) => Some(cfg.clone()),
            None => {
                let page = peer.page(EntityKind::NetworkConfig, 0, 1).map_err(PhaseError::Network)?;
                match page.records.into_iter().next() {
                    Some(v) => Some(
                        serde_json::from_value::<NetworkConfig>(v)
                            .map_err(|e| PhaseError::Rejected(format!("network config: {e}")))?,
                    ),
                    None => None,
                }
            }
        };
        let stats = report.entities.entry(EntityKind::NetworkConfig).or_default();
        if let Some(cfg) = cfg {
            stats.fetched += 1;
            if Some(cfg.genesis_hash) != self.ledger.block_hashes().first().copied() {
                return Err(PhaseError::Rejected("network config names another genesis".into()));
            }
            if self.ledger.network_config().is_none() {
                self.ledger.set_network_config(&cfg)?;
                stats.inserted += 1;
            } else {
                stats.skipped += 1;
            }
        }
        let synced = stats.fetched;
        progress(&Progress { phase: SyncPhase::NetworkConfig, entity: EntityKind::NetworkConfig, page: 0, synced });
        Ok(())
    }

    /// Height-aligned pages from the local tip onwards.
    fn pull_blocks(
        &mut self,
        peer: &dyn PeerClient,
        report: &mut SyncReport,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<bool, PhaseError> {
        let size = self.opts.page_size.max(1);
        loop {
            let next = self.ledger.height().map_or(0, |h| h + 1);
            let page_no = next as usize / size;
            let page = peer.page(EntityKind::Blocks, page_no, size).map_err(PhaseError::Network)?;
            let n = page.records.len();
            let mut inserted = 0u64;
            let mut skipped = 0u64;
            for v in page.records {
                let block: Block =
                    serde_json::from_value(v).map_err(|e| PhaseError::Rejected(format!("block: {e}")))?;
                if block.height() < next {
                    skipped += 1;
                    continue;
                }
                self.commit_synced(&block, report)?;
                inserted += 1;
            }
            let stats = report.entities.entry(EntityKind::Blocks).or_default();
            stats.fetched += n as u64;
            stats.inserted += inserted;
            stats.skipped += skipped;
            let synced = stats.fetched;

            let flow = progress(&Progress { phase: SyncPhase::Blocks, entity: EntityKind::Blocks, page: page_no, synced });
            if n < size || !page.has_more {
                return Ok(true);
            }
            if inserted == 0 {
                return Err(PhaseError::Rejected(format!("block page {page_no} made no progress")));
            }
            if flow == Flow::Cancel {
                return Ok(false);
            }
        }
    }

    /// Validate against the local tip, then commit. A mirror failure is
    /// counted and left for the reconcile at the end of the run.
    fn commit_synced(&mut self, block: &Block, report: &mut SyncReport) -> Result<(), PhaseError> {
        let tip = ChainStore::tip(&*self.ledger);
        let confirmed = ChainStore::confirmed(&*self.ledger);
        validate_block::<Ed25519Verifier>(block, tip, &self.ledger.validators(), &*confirmed)
            .map_err(|e| PhaseError::Rejected(e.to_string()))?;
        match self.ledger.commit(block) {
            Ok(_) => {}
            Err(PersistenceError::PartialCommit { height, source, .. }) => {
                warn!(height, error = %source, "synced block missing from mirror");
                report.partial_commits += 1;
            }
            Err(e) => return Err(e.into()),
        }
        self.mempool.remove(&block.tx_hashes());
        self.mempool.purge_confirmed();
        Ok(())
    }

    fn pull_pages(
        &mut self,
        phase: SyncPhase,
        entity: EntityKind,
        peer: &dyn PeerClient,
        now: UnixTime,
        report: &mut SyncReport,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<bool, PhaseError> {
        let size = self.opts.page_size.max(1);
        let mut page_no = 0;
        loop {
            let page = peer.page(entity, page_no, size).map_err(PhaseError::Network)?;
            let n = page.records.len();
            let (inserted, skipped) = self.merge(entity, page.records, now)?;
            let stats = report.entities.entry(entity).or_default();
            stats.fetched += n as u64;
            stats.inserted += inserted;
            stats.skipped += skipped;
            let synced = stats.fetched;

            let flow = progress(&Progress { phase, entity, page: page_no, synced });
            if n < size || !page.has_more {
                return Ok(true);
            }
            if flow == Flow::Cancel {
                return Ok(false);
            }
            page_no += 1;
        }
    }

    /// Insert-if-absent merge of one page; returns (inserted, skipped).
    fn merge(&mut self, entity: EntityKind, records: Vec<Value>, now: UnixTime) -> Result<(u64, u64), PhaseError> {
        let total = records.len() as u64;
        let inserted = match entity {
            EntityKind::Nodes => {
                let nodes: Vec<_> = records
                    .into_iter()
                    .filter_map(|v| serde_json::from_value::<RemoteNode>(v).ok()?.into_peer_node(now).ok())
                    .collect();
                self.ledger.upsert_nodes(&nodes)?
            }
            EntityKind::Validators => {
                let vals: Vec<Validator> = records.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect();
                self.ledger.merge_validators(vals)?
            }
            EntityKind::Transactions => {
                // only rows for transactions the local chain already confirmed
                let index = self.ledger.confirmed_index();
                let rows: Vec<Value> = records
                    .into_iter()
                    .filter(|v| {
                        serde_json::from_value::<Transaction>(v.clone())
                            .map(|tx| crate::mempool::ConfirmedIndex::contains_hash(&*index, &tx.hash))
                            .unwrap_or(false)
                    })
                    .collect();
                self.ledger.merge_rows(Table::Transactions, "hash", rows)?
            }
            EntityKind::Mempool => {
                let mut admitted = 0;
                for v in records {
                    let Ok(mut tx) = serde_json::from_value::<Transaction>(v) else { continue };
                    tx.status = TxStatus::Pending;
                    tx.block_height = None;
                    if self.mempool.admit(tx, now).is_ok() {
                        admitted += 1;
                    }
                }
                admitted
            }
            EntityKind::Contracts => self.ledger.merge_rows(Table::Contracts, entity.natural_key(), records)?,
            EntityKind::Staking => self.ledger.merge_rows(Table::Staking, entity.natural_key(), records)?,
            other => return Err(PhaseError::Fatal(SyncError::LocalOnly(other))),
        } as u64;
        Ok((inserted, total.saturating_sub(inserted)))
    }
}
