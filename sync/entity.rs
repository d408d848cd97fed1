use crate::ledger::mirror::Table;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every entity type a node persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Blocks,
    Transactions,
    Validators,
    Nodes,
    Staking,
    Contracts,
    Mempool,
    NetworkConfig,
    NodeConfig,
    Logs,
    AdminAccounts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncClass {
    /// Must converge across honest nodes; pulled from peers.
    ConsensusCritical,
    /// Never leaves the node.
    LocalOnly,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Blocks,
        EntityKind::Transactions,
        EntityKind::Validators,
        EntityKind::Nodes,
        EntityKind::Staking,
        EntityKind::Contracts,
        EntityKind::Mempool,
        EntityKind::NetworkConfig,
        EntityKind::NodeConfig,
        EntityKind::Logs,
        EntityKind::AdminAccounts,
    ];

    pub fn class(self) -> SyncClass {
        match self {
            EntityKind::NodeConfig | EntityKind::Logs | EntityKind::AdminAccounts => SyncClass::LocalOnly,
            _ => SyncClass::ConsensusCritical,
        }
    }

    pub fn is_syncable(self) -> bool {
        self.class() == SyncClass::ConsensusCritical
    }

    /// Path segment on the peer query surface.
    pub fn path(self) -> &'static str {
        match self {
            EntityKind::Blocks => "blocks",
            EntityKind::Transactions => "transactions",
            EntityKind::Validators => "validators",
            EntityKind::Nodes => "nodes",
            EntityKind::Staking => "staking",
            EntityKind::Contracts => "contracts",
            EntityKind::Mempool => "mempool",
            EntityKind::NetworkConfig => "network_config",
            EntityKind::NodeConfig => "node_config",
            EntityKind::Logs => "logs",
            EntityKind::AdminAccounts => "admin_accounts",
        }
    }

    /// Field that identifies a record across nodes.
    pub fn natural_key(self) -> &'static str {
        match self {
            EntityKind::Blocks => "height",
            EntityKind::Transactions | EntityKind::Mempool => "hash",
            EntityKind::Validators | EntityKind::Contracts => "address",
            EntityKind::Nodes => "node_id",
            EntityKind::Staking => "id",
            EntityKind::NetworkConfig => "chain_id",
            EntityKind::NodeConfig | EntityKind::Logs | EntityKind::AdminAccounts => "id",
        }
    }

    /// Mirror table backing this entity, if it is stored there.
    pub fn table(self) -> Option<Table> {
        match self {
            EntityKind::Blocks => Some(Table::Blocks),
            EntityKind::Transactions => Some(Table::Transactions),
            EntityKind::Validators => Some(Table::Validators),
            EntityKind::Nodes => Some(Table::Nodes),
            EntityKind::Staking => Some(Table::Staking),
            EntityKind::Contracts => Some(Table::Contracts),
            EntityKind::NetworkConfig => Some(Table::NetworkConfig),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.path() == s)
            .ok_or_else(|| format!("unknown entity {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_entities_are_not_syncable() {
        let local: Vec<_> = EntityKind::ALL.into_iter().filter(|k| !k.is_syncable()).collect();
        assert_eq!(local, vec![EntityKind::NodeConfig, EntityKind::Logs, EntityKind::AdminAccounts]);
        assert!(EntityKind::Mempool.is_syncable());
        assert!(local.iter().all(|k| k.table().is_none()));
    }

    #[test]
    fn path_round_trips() {
        for k in EntityKind::ALL {
            assert_eq!(k.path().parse::<EntityKind>().unwrap(), k);
        }
        assert!("wallets".parse::<EntityKind>().is_err());
    }
}
