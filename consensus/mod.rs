pub mod block_producer;
pub mod engine;
pub mod validator_set;

pub use block_producer::*;
pub use engine::*;
pub use validator_set::*;
