//! Peer query surface.
//!
//! Client side: `GET {base}/status` and `GET {base}/{entity}?page=N&size=M`
//! answering `{ "success": bool, "records": [...], "has_more": bool }`.
//! Block pages are height-aligned: page N of size M holds heights
//! `N*M .. N*M+M`.
//!
//! `LedgerPeer` answers the same queries from a local ledger so nodes can be
//! wired to each other in-process.

use super::entity::EntityKind;
use crate::ledger::Ledger;
use crate::mempool::Mempool;
use crate::types::{Hash32, Height, NetworkConfig};
use parking_lot::RwLock;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer {peer} unreachable: {detail}")]
    Unreachable { peer: String, detail: String },
    #[error("peer {peer} answered HTTP {status}")]
    Http { peer: String, status: u16 },
    #[error("peer {peer} sent a malformed response: {detail}")]
    Malformed { peer: String, detail: String },
    #[error("peer {peer} refused {entity}")]
    Refused { peer: String, entity: EntityKind },
}

/// Answer to the status probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_id: String,
    pub chain_id: Option<u64>,
    pub genesis_hash: Option<Hash32>,
    pub height: Option<Height>,
    pub tip_hash: Option<Hash32>,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerPage {
    pub success: bool,
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
}

impl PeerPage {
    fn refused() -> Self {
        Self { success: false, records: Vec::new(), has_more: false }
    }
}

pub trait PeerClient: Send + Sync {
    /// Stable label for logs and reports.
    fn id(&self) -> &str;
    fn status(&self) -> Result<PeerStatus, NetworkError>;
    fn page(&self, entity: EntityKind, page: usize, size: usize) -> Result<PeerPage, NetworkError>;
}

pub struct HttpPeer {
    base: String,
    client: Client,
}

impl HttpPeer {
    pub fn new(base: &str, connect_timeout: Duration, timeout: Duration) -> Result<Self, NetworkError> {
        let base = base.trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Unreachable { peer: base.clone(), detail: e.to_string() })?;
        Ok(Self { base, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NetworkError> {
        let peer = || self.base.clone();
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .map_err(|e| NetworkError::Unreachable { peer: peer(), detail: e.to_string() })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NetworkError::Http { peer: peer(), status: status.as_u16() });
        }
        resp.json().map_err(|e| NetworkError::Malformed { peer: peer(), detail: e.to_string() })
    }
}

impl PeerClient for HttpPeer {
    fn id(&self) -> &str {
        &self.base
    }

    fn status(&self) -> Result<PeerStatus, NetworkError> {
        self.get_json("status")
    }

    fn page(&self, entity: EntityKind, page: usize, size: usize) -> Result<PeerPage, NetworkError> {
        let out: PeerPage = self.get_json(&format!("{}?page={page}&size={size}", entity.path()))?;
        if !out.success {
            return Err(NetworkError::Refused { peer: self.base.clone(), entity });
        }
        Ok(out)
    }
}

/// Serves the peer surface from a local ledger and mempool.
#[derive(Clone)]
pub struct LedgerPeer {
    node_id: String,
    ledger: Arc<RwLock<Ledger>>,
    mempool: Arc<Mempool>,
}

impl LedgerPeer {
    pub fn new(node_id: impl Into<String>, ledger: Arc<RwLock<Ledger>>, mempool: Arc<Mempool>) -> Self {
        Self { node_id: node_id.into(), ledger, mempool }
    }

    /// Build the response for one page request. Local-only entities are refused.
    pub fn serve(&self, entity: EntityKind, page: usize, size: usize) -> PeerPage {
        if !entity.is_syncable() {
            return PeerPage::refused();
        }
        let size = size.max(1);
        let ledger = self.ledger.read();
        let (records, has_more) = match entity {
            EntityKind::Blocks => {
                let from = page.saturating_mul(size) as Height;
                match ledger.blocks_from(from, size) {
                    Ok(p) => (p.records.iter().filter_map(|b| serde_json::to_value(b).ok()).collect(), p.has_more),
                    Err(_) => return PeerPage::refused(),
                }
            }
            EntityKind::Mempool => {
                let p = self.mempool.page(page, size);
                (p.records.iter().filter_map(|e| serde_json::to_value(&e.tx).ok()).collect(), p.has_more)
            }
            other => match other.table() {
                Some(table) => {
                    let p = ledger.table_page(table, page, size);
                    (p.records, p.has_more)
                }
                None => return PeerPage::refused(),
            },
        };
        PeerPage { success: true, records, has_more }
    }

    pub fn local_status(&self) -> PeerStatus {
        let ledger = self.ledger.read();
        let network = ledger.network_config();
        PeerStatus {
            node_id: self.node_id.clone(),
            chain_id: network.as_ref().map(|n| n.chain_id),
            genesis_hash: ledger.block_hashes().first().copied(),
            height: ledger.height(),
            tip_hash: ledger.tip_hash(),
            network,
        }
    }
}

impl PeerClient for LedgerPeer {
    fn id(&self) -> &str {
        &self.node_id
    }

    fn status(&self) -> Result<PeerStatus, NetworkError> {
        Ok(self.local_status())
    }

    fn page(&self, entity: EntityKind, page: usize, size: usize) -> Result<PeerPage, NetworkError> {
        let out = self.serve(entity, page, size);
        if !out.success {
            return Err(NetworkError::Refused { peer: self.node_id.clone(), entity });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::GenesisParams;
    use crate::mempool::PoolPolicy;
    use crate::storage::DataDir;
    use crate::types::{Address, Amount};

    fn peer() -> (tempfile::TempDir, LedgerPeer) {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(&DataDir::new(dir.path()), 8, 0).unwrap();
        ledger
            .init_genesis(GenesisParams {
                creator: Address::from_bytes([1; 20]),
                timestamp: 10,
                network: NetworkConfig {
                    chain_id: 3,
                    network_name: "p".into(),
                    genesis_hash: Hash32::zero(),
                    fee_floor: Amount::from_units(1),
                    max_txs_per_block: 5,
                    reward_rate_bps: 0,
                },
                validators: vec![],
            })
            .unwrap();
        let mempool = Arc::new(Mempool::new(PoolPolicy::default(), ledger.confirmed_index()));
        (dir, LedgerPeer::new("ref", Arc::new(RwLock::new(ledger)), mempool))
    }

    #[test]
    fn serves_status_and_pages() {
        let (_dir, p) = peer();
        let st = p.status().unwrap();
        assert_eq!(st.chain_id, Some(3));
        assert_eq!(st.height, Some(0));
        assert_eq!(st.genesis_hash, st.tip_hash);

        let blocks = p.page(EntityKind::Blocks, 0, 10).unwrap();
        assert_eq!(blocks.records.len(), 1);
        assert!(!blocks.has_more);
        assert!(p.page(EntityKind::Blocks, 1, 10).unwrap().records.is_empty());
        assert_eq!(p.page(EntityKind::NetworkConfig, 0, 10).unwrap().records.len(), 1);
    }

    #[test]
    fn refuses_local_only_entities() {
        let (_dir, p) = peer();
        assert!(!p.serve(EntityKind::AdminAccounts, 0, 10).success);
        assert!(matches!(p.page(EntityKind::Logs, 0, 10), Err(NetworkError::Refused { .. })));
    }

    #[test]
    fn http_peer_builds_urls() {
        let p = HttpPeer::new("http://10.0.0.1:8080/", Duration::from_secs(1), Duration::from_secs(2)).unwrap();
        assert_eq!(p.id(), "http://10.0.0.1:8080");
        assert_eq!(p.url("status"), "http://10.0.0.1:8080/status");
    }
}
