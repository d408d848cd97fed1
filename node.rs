//! Node facade: one bounded unit of work per call.
//!
//! Every operation that writes to the data directory holds the node-wide
//! lock for its duration and starts by catching up with what other handles
//! on the same directory wrote: new ledger blocks, mirror rows, the pending
//! pool and the keyring.

use crate::config::NodeConfig;
use crate::consensus::{ConsensusError, Engine, ProduceOutcome, Validator};
use crate::context::RunContext;
use crate::crypto::ed25519::Ed25519Keypair;
use crate::crypto::keyring::Keyring;
use crate::intake::{IntakeQueue, IntakeRecord, IntakeReport};
use crate::ledger::{ChainReport, GenesisParams, Ledger, PersistenceError, ReconcileReport};
use crate::lock::{LockError, NodeLock};
use crate::mempool::{Mempool, MempoolDiagnostics, SweepReport};
use crate::normalize::Normalizer;
use crate::storage::DataDir;
use crate::sync::select::{probe_all, ChainIdentity};
use crate::sync::{Flow, HttpPeer, LedgerPeer, NetworkError, PeerClient, PeerProbe, Progress, SyncError, SyncManager, SyncReport};
use crate::types::{Address, Block, Hash32, Height, NetworkConfig, UnixTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("keyring holds no validator keys")]
    NoValidatorKeys,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub chain_id: Option<u64>,
    pub height: Option<Height>,
    pub tip_hash: Option<Hash32>,
    pub transactions: usize,
    pub validators: usize,
    pub validator_set_hash: String,
    pub local_keys: usize,
    pub mempool: MempoolDiagnostics,
    pub peers: Vec<PeerProbe>,
}

pub fn unix_now() -> UnixTime {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub struct NodeCore {
    cfg: NodeConfig,
    data: DataDir,
    ledger: Arc<RwLock<Ledger>>,
    mempool: Arc<Mempool>,
    keyring: Keyring,
    normalizer: Normalizer,
    engine: Engine,
}

impl NodeCore {
    pub fn open(cfg: NodeConfig) -> Result<Self, NodeError> {
        let data = DataDir::new(&cfg.node.data_dir);
        data.ensure()?;
        let ledger = Ledger::open(&data, cfg.ledger.cache_blocks, unix_now())?;
        let mempool = Mempool::open(data.mempool_path(), cfg.pool_policy(), ledger.confirmed_index())?;
        let keyring = Keyring::load(data.keyring_path())?;
        let normalizer = Normalizer::new(cfg.mempool.fee_floor).with_base_fee(cfg.intake.base_fee_wei);
        let engine = Engine::new(cfg.engine_config());
        info!(
            data_dir = %data.root().display(),
            height = ?ledger.height(),
            pending = mempool.len(),
            keys = keyring.len(),
            "node opened"
        );
        Ok(Self {
            cfg,
            data,
            ledger: Arc::new(RwLock::new(ledger)),
            mempool: Arc::new(mempool),
            keyring,
            normalizer,
            engine,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn height(&self) -> Option<Height> {
        self.ledger.read().height()
    }

    pub fn tx_count(&self) -> usize {
        self.ledger.read().tx_count()
    }

    pub fn block(&self, height: Height) -> Result<Option<Block>, NodeError> {
        Ok(self.ledger.read().block(height)?)
    }

    pub fn block_hashes(&self) -> Vec<Hash32> {
        self.ledger.read().block_hashes().to_vec()
    }

    fn lock(&self, operation: &str, now: UnixTime) -> Result<NodeLock, NodeError> {
        Ok(NodeLock::acquire(self.data.lock_path(), operation, now, self.cfg.node.lock_stale_secs)?)
    }

    /// Lock, then reload ledger and pool state from disk.
    fn begin(&self, operation: &str, now: UnixTime) -> Result<NodeLock, NodeError> {
        let lock = self.lock(operation, now)?;
        self.refresh()?;
        Ok(lock)
    }

    /// Pick up blocks, mirror rows and pending entries written by other
    /// handles on this data directory. Returns the number of new blocks.
    pub fn refresh(&self) -> Result<usize, NodeError> {
        let added = self.ledger.write().refresh()?;
        self.mempool.reload()?;
        Ok(added)
    }

    fn reload_keyring(&mut self) -> Result<(), NodeError> {
        self.keyring = Keyring::load(self.data.keyring_path())?;
        Ok(())
    }

    pub fn intake_queue(&self) -> io::Result<IntakeQueue> {
        IntakeQueue::open(self.cfg.intake_dir())
    }

    /// Queue a raw transaction for the next intake sweep.
    pub fn submit_raw(&self, name: &str, record: &IntakeRecord) -> Result<PathBuf, NodeError> {
        Ok(self.intake_queue()?.enqueue(name, record)?)
    }

    pub fn admit_intake(&self, now: UnixTime, ctx: &RunContext) -> Result<IntakeReport, NodeError> {
        let _lock = self.begin("intake", now)?;
        let queue = self.intake_queue()?;
        let report = queue.sweep(&self.normalizer, &self.mempool, now, self.cfg.intake.max_records_per_sweep, ctx)?;
        self.mempool.flush()?;
        Ok(report)
    }

    pub fn sweep_mempool(&self, now: UnixTime) -> Result<SweepReport, NodeError> {
        let _lock = self.begin("sweep", now)?;
        let report = self.mempool.sweep_expired(now);
        self.mempool.flush()?;
        Ok(report)
    }

    pub fn produce_block(&mut self, now: UnixTime) -> Result<ProduceOutcome, NodeError> {
        let _lock = self.begin("produce", now)?;
        self.reload_keyring()?;
        let mut ledger = self.ledger.write();
        if self.cfg.ledger.reconcile_on_produce {
            ledger.reconcile()?;
        }
        self.mempool.sweep_expired(now);
        Ok(self.engine.produce(&mut *ledger, &self.mempool, &self.keyring, now)?)
    }

    /// HTTP clients for the configured peers.
    pub fn configured_peers(&self) -> Result<Vec<Box<dyn PeerClient>>, NodeError> {
        self.cfg
            .sync
            .peers
            .iter()
            .map(|url| -> Result<Box<dyn PeerClient>, NodeError> {
                let p = HttpPeer::new(url, self.cfg.connect_timeout(), self.cfg.request_timeout())?;
                Ok(Box::new(p))
            })
            .collect()
    }

    pub fn sync_once(
        &mut self,
        peers: &[Box<dyn PeerClient>],
        now: UnixTime,
        progress: &mut dyn FnMut(&Progress) -> Flow,
    ) -> Result<SyncReport, NodeError> {
        let _lock = self.begin("sync", now)?;
        let mut ledger = self.ledger.write();
        let mut mgr = SyncManager::new(&mut *ledger, &self.mempool, self.data.sync_state_path(), self.cfg.sync_options());
        Ok(mgr.run(peers, now, progress)?)
    }

    pub fn reconcile(&mut self, now: UnixTime) -> Result<ReconcileReport, NodeError> {
        let _lock = self.begin("reconcile", now)?;
        Ok(self.ledger.write().reconcile()?)
    }

    pub fn verify_chain(&self) -> Result<ChainReport, NodeError> {
        Ok(self.ledger.read().verify_chain()?)
    }

    /// Create block 0 with every keyring validator staked `genesis.stake_each`.
    pub fn init_genesis(&mut self, now: UnixTime) -> Result<Block, NodeError> {
        let _lock = self.begin("genesis", now)?;
        self.reload_keyring()?;
        let validators: Vec<Validator> = self
            .keyring
            .public_keys()
            .map(|pk| Validator::new(pk, self.cfg.genesis.stake_each))
            .collect();
        let creator = validators.first().map(|v| v.address.clone()).ok_or(NodeError::NoValidatorKeys)?;
        let g = &self.cfg.genesis;
        let params = GenesisParams {
            creator,
            timestamp: now,
            network: NetworkConfig {
                chain_id: g.chain_id,
                network_name: g.network_name.clone(),
                genesis_hash: Hash32::zero(),
                fee_floor: self.cfg.mempool.fee_floor,
                max_txs_per_block: self.cfg.consensus.max_txs_per_block,
                reward_rate_bps: g.reward_rate_bps,
            },
            validators,
        };
        Ok(self.ledger.write().init_genesis(params)?)
    }

    /// Generate a validator key and persist the keyring.
    pub fn generate_key(&mut self) -> Result<Address, NodeError> {
        let _lock = self.lock("keygen", unix_now())?;
        self.reload_keyring()?;
        let addr = self.keyring.insert(Ed25519Keypair::generate());
        self.keyring.save(self.data.keyring_path())?;
        Ok(addr)
    }

    /// This node seen through the peer query surface.
    pub fn peer_view(&self) -> LedgerPeer {
        LedgerPeer::new(self.cfg.node.node_id.clone(), Arc::clone(&self.ledger), Arc::clone(&self.mempool))
    }

    pub fn status(&self, peers: &[Box<dyn PeerClient>]) -> NodeStatusReport {
        let ledger = self.ledger.read();
        let network = ledger.network_config();
        let identity = ChainIdentity {
            chain_id: network.as_ref().map(|n| n.chain_id),
            genesis_hash: ledger.block_hashes().first().copied(),
        };
        let probes = probe_all(peers, &identity, |id| ledger.node(id).map_or(0, |n| n.reputation_score));
        let vset = ledger.validators();
        NodeStatusReport {
            node_id: self.cfg.node.node_id.clone(),
            chain_id: identity.chain_id,
            height: ledger.height(),
            tip_hash: ledger.tip_hash(),
            transactions: ledger.tx_count(),
            validators: vset.len(),
            validator_set_hash: vset.hash_hex(),
            local_keys: self.keyring.len(),
            mempool: self.mempool.diagnostics(),
            peers: probes,
        }
    }
}
