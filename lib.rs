pub mod config;
pub mod consensus;
pub mod context;
pub mod crypto;
pub mod intake;
pub mod ledger;
pub mod lock;
pub mod mempool;
pub mod merkle;
pub mod node;
pub mod normalize;
pub mod storage;
pub mod sync;
pub mod types;
