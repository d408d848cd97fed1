use super::peer::{PeerClient, PeerStatus};
use crate::types::Hash32;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    LowestLatency,
    HighestHeight,
    HighestReputation,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lowest-latency" => Ok(Self::LowestLatency),
            "highest-height" => Ok(Self::HighestHeight),
            "highest-reputation" => Ok(Self::HighestReputation),
            other => Err(format!("unknown peer selection strategy {other:?}")),
        }
    }
}

/// Outcome of probing one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerProbe {
    pub index: usize,
    pub peer: String,
    pub latency_ms: Option<u64>,
    pub status: Option<PeerStatus>,
    pub reputation: i64,
    /// Why the peer is not usable, if it is not.
    pub error: Option<String>,
}

impl PeerProbe {
    pub fn usable(&self) -> bool {
        self.error.is_none() && self.status.is_some()
    }
}

/// Chain identity a peer must share with us.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainIdentity {
    pub chain_id: Option<u64>,
    pub genesis_hash: Option<Hash32>,
}

impl ChainIdentity {
    fn check(&self, st: &PeerStatus) -> Result<(), String> {
        if let (Some(ours), Some(theirs)) = (self.chain_id, st.chain_id) {
            if ours != theirs {
                return Err(format!("chain id {theirs} differs from local {ours}"));
            }
        }
        if let (Some(ours), Some(theirs)) = (self.genesis_hash, st.genesis_hash) {
            if ours != theirs {
                return Err(format!("genesis {theirs} differs from local {ours}"));
            }
        }
        if st.genesis_hash.is_none() {
            return Err("peer has no genesis".into());
        }
        Ok(())
    }
}

/// Probe every peer once, timing the status call.
pub fn probe_all(
    peers: &[Box<dyn PeerClient>],
    local: &ChainIdentity,
    reputation: impl Fn(&str) -> i64,
) -> Vec<PeerProbe> {
    peers
        .iter()
        .enumerate()
        .map(|(index, p)| {
            let started = Instant::now();
            let res = p.status();
            let latency_ms = started.elapsed().as_millis() as u64;
            let (status, error, latency_ms) = match res {
                Ok(st) => {
                    let err = local.check(&st).err();
                    (Some(st), err, Some(latency_ms))
                }
                Err(e) => (None, Some(e.to_string()), None),
            };
            let reputation = status.as_ref().map_or(0, |s| reputation(&s.node_id));
            debug!(peer = p.id(), ?latency_ms, error = ?error, "peer probed");
            PeerProbe { index, peer: p.id().to_string(), latency_ms, status, reputation, error }
        })
        .collect()
}

/// Usable probes best-first under `strategy`. Ties fall back to latency and
/// then to the order peers were configured in.
pub fn rank(probes: &[PeerProbe], strategy: SelectionStrategy) -> Vec<&PeerProbe> {
    let mut usable: Vec<&PeerProbe> = probes.iter().filter(|p| p.usable()).collect();
    let latency = |p: &PeerProbe| p.latency_ms.unwrap_or(u64::MAX);
    let height = |p: &PeerProbe| p.status.as_ref().and_then(|s| s.height);
    usable.sort_by(|a, b| {
        let primary = match strategy {
            SelectionStrategy::LowestLatency => std::cmp::Ordering::Equal,
            SelectionStrategy::HighestHeight => height(b).cmp(&height(a)),
            SelectionStrategy::HighestReputation => b.reputation.cmp(&a.reputation),
        };
        primary.then(latency(a).cmp(&latency(b))).then(a.index.cmp(&b.index))
    });
    usable
}
