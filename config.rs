//! TOML node configuration.
//!
//! Loaded from `--config` (default `./stakenode.toml`); a missing file means
//! defaults everywhere. CLI flags override individual values.

use crate::consensus::EngineConfig;
use crate::mempool::PoolPolicy;
use crate::sync::{SelectionStrategy, SyncOptions};
use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub mempool: MempoolSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub intake: IntakeSection,
    #[serde(default)]
    pub genesis: GenesisSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: String,
    /// Identity reported on the status endpoint.
    pub node_id: String,
    pub log_level: String,
    /// A lock file older than this is considered abandoned.
    pub lock_stale_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: "./data/node".into(),
            node_id: "node-1".into(),
            log_level: "info".into(),
            lock_stale_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub age_boost_secs: u64,
    pub fee_floor: Amount,
}

impl Default for MempoolSection {
    fn default() -> Self {
        let p = PoolPolicy::default();
        Self { capacity: p.capacity, ttl_secs: p.ttl_secs, age_boost_secs: p.age_boost_secs, fee_floor: p.fee_floor }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub max_txs_per_block: usize,
    pub produce_empty_blocks: bool,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        let e = EngineConfig::default();
        Self {
            max_txs_per_block: e.max_txs_per_block,
            produce_empty_blocks: e.produce_empty_blocks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Blocks kept in the read cache.
    pub cache_blocks: usize,
    /// Run `reconcile` before every production attempt.
    pub reconcile_on_produce: bool,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self { cache_blocks: 256, reconcile_on_produce: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Peer base URLs, e.g. "http://10.0.0.2:8080".
    pub peers: Vec<String>,
    pub strategy: SelectionStrategy,
    pub page_size: usize,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            strategy: SelectionStrategy::LowestLatency,
            page_size: 100,
            connect_timeout_ms: 2_000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSection {
    /// Relative paths resolve under `node.data_dir`.
    pub queue_dir: String,
    pub max_records_per_sweep: usize,
    /// Base fee (wei) used for typed fee-market envelopes.
    pub base_fee_wei: u128,
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self { queue_dir: "intake".into(), max_records_per_sweep: 1_000, base_fee_wei: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisSection {
    pub chain_id: u64,
    pub network_name: String,
    /// Stake given to every keyring validator at genesis.
    pub stake_each: Amount,
    pub reward_rate_bps: u64,
}

impl Default for GenesisSection {
    fn default() -> Self {
        Self {
            chain_id: 1,
            network_name: "stakenet".into(),
            stake_each: Amount::from_units(1_000 * crate::types::UNITS_PER_TOKEN),
            reward_rate_bps: 500,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: NodeConfig = toml::from_str(&s)?;
        Ok(cfg)
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            capacity: self.mempool.capacity,
            ttl_secs: self.mempool.ttl_secs,
            age_boost_secs: self.mempool.age_boost_secs,
            fee_floor: self.mempool.fee_floor,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_txs_per_block: self.consensus.max_txs_per_block,
            produce_empty_blocks: self.consensus.produce_empty_blocks,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions { page_size: self.sync.page_size, strategy: self.sync.strategy }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.timeout_ms)
    }

    pub fn intake_dir(&self) -> PathBuf {
        let p = PathBuf::from(&self.intake.queue_dir);
        if p.is_absolute() {
            p
        } else {
            Path::new(&self.node.data_dir).join(p)
        }
    }

    pub fn example_toml() -> &'static str {
        r#"# stakenode configuration
# All values shown are defaults.

[node]
data_dir        = "./data/node"
node_id         = "node-1"
log_level       = "info"    # trace | debug | info | warn | error
lock_stale_secs = 600       # take over node.lock files older than this

[mempool]
capacity       = 10000
ttl_secs       = 3600
age_boost_secs = 600        # waiting this long doubles an entry's priority
fee_floor      = "0.00001000"

[consensus]
max_txs_per_block    = 500
produce_empty_blocks = false

[ledger]
cache_blocks         = 256
reconcile_on_produce = true

[sync]
peers = [
  # "http://10.0.0.2:8080",
]
strategy           = "lowest-latency"  # lowest-latency | highest-height | highest-reputation
page_size          = 100
connect_timeout_ms = 2000
timeout_ms         = 10000

[intake]
queue_dir             = "intake"   # relative to data_dir
max_records_per_sweep = 1000
base_fee_wei          = 0

[genesis]
chain_id        = 1
network_name    = "stakenet"
stake_each      = "1000.00000000"
reward_rate_bps = 500
"#
    }

    pub fn write_example(path: &str) -> std::io::Result<()> {
        std::fs::write(path, Self::example_toml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_parses_to_defaults() {
        let cfg: NodeConfig = toml::from_str(NodeConfig::example_toml()).unwrap();
        let d = NodeConfig::default();
        assert_eq!(cfg.mempool.fee_floor, d.mempool.fee_floor);
        assert_eq!(cfg.mempool.capacity, d.mempool.capacity);
        assert_eq!(cfg.consensus.max_txs_per_block, d.consensus.max_txs_per_block);
        assert_eq!(cfg.sync.strategy, SelectionStrategy::LowestLatency);
        assert_eq!(cfg.genesis.stake_each, d.genesis.stake_each);
        assert_eq!(cfg.intake_dir(), Path::new("./data/node").join("intake"));
    }

    #[test]
    fn missing_file_and_partial_sections() {
        assert_eq!(NodeConfig::load("/nonexistent/stakenode.toml").unwrap().node.node_id, "node-1");
        let cfg: NodeConfig = toml::from_str("[sync]\nstrategy = \"highest-height\"\n").unwrap();
        assert_eq!(cfg.sync.strategy, SelectionStrategy::HighestHeight);
        assert_eq!(cfg.sync.page_size, 100);
        assert!(toml::from_str::<NodeConfig>("[sync]\nstrategy = \"random\"\n").is_err());
    }
}
