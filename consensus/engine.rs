use crate::consensus::block_producer::{assemble, check_block_content, select_batch, sign_block, ProduceOutcome};
use crate::consensus::validator_set::ValidatorSet;
use crate::crypto::ed25519::Ed25519Verifier;
use crate::crypto::keyring::Keyring;
use crate::crypto::{CryptoError, PublicKeyBytes, SignatureBytes, Verifier};
use crate::ledger::{CommitReceipt, Ledger, PersistenceError};
use crate::mempool::{ConfirmedIndex, Mempool};
use crate::merkle::merkle_root;
use crate::types::{Address, Block, Hash32, Height, UnixTime, GENESIS_PREVIOUS_HASH};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("ledger has no genesis block")]
    NoGenesis,
    #[error("no active validator with stake")]
    NoActiveValidators,
    #[error("invalid block {height}: {reason}")]
    InvalidBlock { height: Height, reason: String },
    #[error("signing failed: {0}")]
    Signing(#[from] CryptoError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ConsensusError {
    fn invalid(height: Height, reason: impl Into<String>) -> Self {
        ConsensusError::InvalidBlock { height, reason: reason.into() }
    }
}

/// Progress of the current height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AwaitingTransactions,
    ProducerSelected,
    BlockSigned,
    Persisted,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_txs_per_block: usize,
    /// Produce a block even when the mempool is empty.
    pub produce_empty_blocks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_txs_per_block: 500, produce_empty_blocks: false }
    }
}

/// What the engine needs from persistence.
pub trait ChainStore {
    /// (height, hash) of the current tip.
    fn tip(&self) -> Option<(Height, Hash32)>;
    fn validators(&self) -> ValidatorSet;
    /// Confirmed transactions, for the block content rules.
    fn confirmed(&self) -> Arc<dyn ConfirmedIndex>;
    fn save_validators(&mut self, set: &ValidatorSet) -> Result<(), PersistenceError>;
    fn commit(&mut self, block: &Block) -> Result<CommitReceipt, PersistenceError>;
}

impl ChainStore for Ledger {
    fn tip(&self) -> Option<(Height, Hash32)> {
        Some((self.height()?, self.tip_hash()?))
    }

    fn validators(&self) -> ValidatorSet {
        Ledger::validators(self)
    }

    fn confirmed(&self) -> Arc<dyn ConfirmedIndex> {
        self.confirmed_index()
    }

    fn save_validators(&mut self, set: &ValidatorSet) -> Result<(), PersistenceError> {
        Ledger::save_validators(self, set).map(|_| ())
    }

    fn commit(&mut self, block: &Block) -> Result<CommitReceipt, PersistenceError> {
        Ledger::commit(self, block)
    }
}

/// Check a block against the tip it claims to extend.
///
/// Genesis carries no signature. Every other block must be created and
/// signed by the producer `validators` select for its height, and its body
/// must satisfy the block content rules against `confirmed`.
pub fn validate_block<V: Verifier>(
    block: &Block,
    tip: Option<(Height, Hash32)>,
    validators: &ValidatorSet,
    confirmed: &dyn ConfirmedIndex,
) -> Result<(), ConsensusError> {
    let h = block.height();
    let (want_height, want_prev) = match tip {
        None => (0, GENESIS_PREVIOUS_HASH),
        Some((height, hash)) => (height + 1, hash),
    };
    if h != want_height {
        return Err(ConsensusError::invalid(h, format!("expected height {want_height}")));
    }
    if block.header.previous_hash != want_prev {
        return Err(ConsensusError::invalid(h, format!("previous hash does not match {want_prev}")));
    }
    if block.header.tx_count as usize != block.transactions.len() {
        return Err(ConsensusError::invalid(h, "tx_count does not match body"));
    }
    if merkle_root(&block.tx_hashes()) != block.header.merkle_root {
        return Err(ConsensusError::invalid(h, "merkle root mismatch"));
    }
    if block.header.hash() != block.hash {
        return Err(ConsensusError::invalid(h, "block hash does not match header"));
    }
    if block.is_genesis() {
        return Ok(());
    }
    let creator = validators
        .get(&block.header.creator)
        .ok_or_else(|| ConsensusError::invalid(h, format!("unknown creator {}", block.header.creator)))?;
    let mut schedule = validators.clone();
    schedule.release_expired(h);
    let expected = schedule
        .select_producer(&want_prev, h)
        .ok_or_else(|| ConsensusError::invalid(h, "no active validator to produce it"))?;
    if expected.address != creator.address {
        return Err(ConsensusError::invalid(
            h,
            format!("creator {} is not the selected producer {}", creator.address, expected.address),
        ));
    }
    check_block_content(&block.transactions, confirmed).map_err(|v| ConsensusError::invalid(h, v.to_string()))?;
    verify_signature::<V>(&creator.public_key, block)
        .map_err(|_| ConsensusError::invalid(h, "bad producer signature"))
}

fn verify_signature<V: Verifier>(pk: &PublicKeyBytes, block: &Block) -> Result<(), CryptoError> {
    V::verify(pk, &block.header.sign_bytes(), &SignatureBytes(block.signature.clone()))
}

pub struct Engine<V: Verifier = Ed25519Verifier> {
    cfg: EngineConfig,
    step: Step,
    _v: PhantomData<V>,
}

impl<V: Verifier> Engine<V> {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg, step: Step::AwaitingTransactions, _v: PhantomData }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn validate<S: ChainStore>(&self, chain: &S, block: &Block) -> Result<(), ConsensusError> {
        validate_block::<V>(block, chain.tip(), &chain.validators(), &*chain.confirmed())
    }

    /// One production attempt for the next height.
    ///
    /// When the selected producer's key is not in `keyring` nothing is
    /// written and the height stays open for the next call. A mirror failure
    /// after the binary write still counts as produced; the outcome carries
    /// `partial`.
    pub fn produce<S: ChainStore>(
        &mut self,
        chain: &mut S,
        mempool: &Mempool,
        keyring: &Keyring,
        now: UnixTime,
    ) -> Result<ProduceOutcome, ConsensusError> {
        self.step = Step::AwaitingTransactions;
        let (tip_height, tip_hash) = chain.tip().ok_or(ConsensusError::NoGenesis)?;
        let height = tip_height + 1;
        let confirmed = chain.confirmed();
        mempool.purge_confirmed();
        if mempool.is_empty() && !self.cfg.produce_empty_blocks {
            debug!(height, "mempool empty; nothing to produce");
            return Ok(ProduceOutcome::Idle { height });
        }

        let mut vset = chain.validators();
        let released = vset.release_expired(height);
        for addr in &released {
            info!(validator = %addr, height, "validator released from jail");
        }
        let producer: Address = vset
            .select_producer(&tip_hash, height)
            .map(|v| v.address.clone())
            .ok_or(ConsensusError::NoActiveValidators)?;
        self.step = Step::ProducerSelected;

        let signer = match keyring.signer_for(&producer) {
            Ok(s) => s,
            Err(e) => {
                warn!(height, producer = %producer, error = %e, "selected producer's key not held locally; height left open");
                self.step = Step::AwaitingTransactions;
                return Ok(ProduceOutcome::Missed { height, producer });
            }
        };

        let batch = select_batch(mempool.select_for_block(usize::MAX), &*confirmed, self.cfg.max_txs_per_block);
        let block = sign_block(assemble(tip_height, tip_hash, producer.clone(), batch, now), signer)?;
        self.step = Step::BlockSigned;
        validate_block::<V>(&block, Some((tip_height, tip_hash)), &vset, &*confirmed)?;

        let (receipt, partial) = match chain.commit(&block) {
            Ok(r) => (r, false),
            Err(PersistenceError::PartialCommit { height, hash, source }) => {
                warn!(height, hash = %hash, error = %source, "block persisted without mirror rows");
                (CommitReceipt { height, hash, tx_count: block.transactions.len() }, true)
            }
            Err(e) => return Err(e.into()),
        };
        self.step = Step::Persisted;

        mempool.remove(&block.tx_hashes());
        mempool.purge_confirmed();
        mempool.flush().map_err(PersistenceError::from)?;
        vset.record_produced(&producer);
        chain.save_validators(&vset)?;
        info!(height, hash = %block.hash, producer = %producer, txs = receipt.tx_count, "block produced");
        Ok(ProduceOutcome::Produced { receipt, producer, partial })
    }
}
