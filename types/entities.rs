//! Synced records that are stored by the ledger but carry no behavior of
//! their own in this core.

use super::{Address, Amount, Hash32, Height, UnixTime};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Banned,
}

/// Entry in the peer directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub node_id: String,
    /// Normalized `protocol://host:port`.
    pub address: String,
    pub status: NodeStatus,
    pub reputation_score: i64,
    pub last_seen: UnixTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingRecord {
    pub id: String,
    pub delegator: Address,
    pub validator: Address,
    pub amount: Amount,
    pub height: Height,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub address: Address,
    pub creator: Address,
    pub code_hash: Hash32,
    pub height: Height,
}

/// Network-wide parameters. Every node of one network must agree on these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub network_name: String,
    pub genesis_hash: Hash32,
    pub fee_floor: Amount,
    pub max_txs_per_block: usize,
    pub reward_rate_bps: u64,
}
