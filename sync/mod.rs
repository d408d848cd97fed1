pub mod entity;
pub mod manager;
pub mod nodes;
pub mod peer;
pub mod select;

pub use entity::{EntityKind, SyncClass};
pub use manager::{EntityStats, Flow, Progress, SyncError, SyncManager, SyncOptions, SyncPhase, SyncReport, SyncState};
pub use peer::{HttpPeer, LedgerPeer, NetworkError, PeerClient, PeerPage, PeerStatus};
pub use select::{PeerProbe, SelectionStrategy};
