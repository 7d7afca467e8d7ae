// Copyright (c) 2024 Botho Foundation

//! The block import and fork-choice engine.
//!
//! [`Blockchain`] ties the ledger, the world state and an [`Executor`]
//! together. Blocks enter through [`Blockchain::try_to_connect`]; the
//! canonical head is whichever known block has the greatest cumulative
//! difficulty, and readers see it through a lock-free snapshot.
//!
//! Invariants between calls:
//! - the world state is committed at the head's state root
//! - the main-chain records are exactly the head and its ancestors
//! - the persisted best-block pointer names the head

mod builder;
mod genesis;
mod import;

pub use genesis::Genesis;
pub use import::{ImportError, ImportStage};

use parking_lot::Mutex;
use primitive_types::U256;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::block::{short_hash, Block, Receipt, EMPTY_ROOT};
use crate::config::ChainConfig;
use crate::difficulty::{DifficultyCalculator, DifficultyError};
use crate::executor::{ExecutionError, Executor};
use crate::head::{ChainHead, HeadError, HeadPublisher};
use crate::ledger::{BlockIndex, BlockRecord, BlockStore, IndexError, IntegrityStatus, LedgerError};
use crate::metrics::ChainMetrics;
use crate::recovery::RecoveryManager;
use crate::state::{StateAccess, StateError};
use crate::storage::{KeyValueStore, StoreError, WriteBatch};

/// Outcome of offering a block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportResult {
    /// Stored and now the canonical head
    ImportedBest,
    /// Stored on a side branch
    ImportedNotBest,
    /// Already known; nothing changed
    Exist,
    /// Rejected; nothing changed
    InvalidBlock,
}

impl ImportResult {
    pub fn is_imported(self) -> bool {
        matches!(self, ImportResult::ImportedBest | ImportResult::ImportedNotBest)
    }

    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            ImportResult::ImportedBest => "imported_best",
            ImportResult::ImportedNotBest => "imported_not_best",
            ImportResult::Exist => "exist",
            ImportResult::InvalidBlock => "invalid_block",
        }
    }
}

impl fmt::Display for ImportResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportResult::ImportedBest => write!(f, "IMPORTED_BEST"),
            ImportResult::ImportedNotBest => write!(f, "IMPORTED_NOT_BEST"),
            ImportResult::Exist => write!(f, "EXIST"),
            ImportResult::InvalidBlock => write!(f, "INVALID_BLOCK"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Difficulty error: {0}")]
    Difficulty(#[from] DifficultyError),

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Head(#[from] HeadError),

    #[error("Genesis block must be at height 0")]
    InvalidGenesis,

    #[error("Genesis state root mismatch: header {expected}, allocation {actual}")]
    GenesisStateMismatch { expected: String, actual: String },

    #[error("Stored genesis {stored} differs from configured genesis {configured}")]
    GenesisMismatch { stored: String, configured: String },

    #[error("Block {0} not found")]
    UnknownBlock(String),

    #[error("Block {0} is not on the canonical chain")]
    NotCanonical(String),

    #[error("World state of block {0} is not available")]
    StateUnavailable(String),

    #[error("Timestamp {timestamp} is beyond the allowed future bound {limit}")]
    FutureTimestamp { timestamp: u64, limit: u64 },

    #[error("Block index is unusable: {0}")]
    IndexCorrupted(IntegrityStatus),

    #[error("World state could not be recovered")]
    WorldStateCorrupted,
}

/// Block import and fork-choice engine.
pub struct Blockchain {
    config: ChainConfig,
    calculator: DifficultyCalculator,
    store: Arc<dyn KeyValueStore>,
    blocks: BlockStore,
    index: BlockIndex,
    executor: Arc<dyn Executor>,
    head: HeadPublisher,
    /// The import lock. Guards the world state, which between imports is
    /// committed at the head's state root.
    state: Mutex<StateAccess>,
    metrics: ChainMetrics,
}

impl Blockchain {
    /// Open a chain on `store`, writing `genesis` if the store is empty.
    ///
    /// Runs the index integrity check if configured and recovers the world
    /// state when the head's state is incomplete.
    pub fn open(
        config: ChainConfig,
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn Executor>,
        genesis: &Genesis,
    ) -> Result<Self, ChainError> {
        let calculator = DifficultyCalculator::new(&config);
        let blocks = BlockStore::new(store.clone());
        let index = BlockIndex::new(store.clone());
        let metrics = ChainMetrics::new();

        let best_hash = match blocks.best_block_hash()? {
            Some(hash) => {
                check_genesis(&index, genesis)?;
                hash
            }
            None => init_genesis(&store, &blocks, &index, &calculator, genesis)?,
        };

        if config.check_index_on_startup {
            let status = index.integrity_check(&calculator)?;
            info!(status = %status, "Checked block index");
            match status {
                IntegrityStatus::Correct => {}
                IntegrityStatus::Fixed => metrics.index_repairs.inc(),
                IntegrityStatus::MissingGenesis | IntegrityStatus::MissingLevel => {
                    return Err(ChainError::IndexCorrupted(status));
                }
            }
        }

        let mut head_block = blocks.require_block(&best_hash)?;
        let mut head_record = index
            .record(&best_hash)?
            .ok_or_else(|| ChainError::UnknownBlock(short_hash(&best_hash)))?;
        let mut state = StateAccess::new(store.clone(), head_block.header.state_root);

        if !state.is_valid_root(&head_block.header.state_root) {
            warn!(
                head = %head_block.description(),
                "World state of the head is incomplete, recovering"
            );
            let recovery = RecoveryManager::new(&blocks, &index, &calculator, &config.prune);
            match recovery.recover_world_state(&mut state, &best_hash)? {
                Some(record) => {
                    metrics.record_recovery(true);
                    head_block = blocks.require_block(&record.hash)?;
                    head_record = record;
                }
                None => {
                    metrics.record_recovery(false);
                    return Err(ChainError::WorldStateCorrupted);
                }
            }
        }

        metrics.best_block_number.set(head_block.number() as i64);
        info!(
            head = %head_block.description(),
            total_difficulty = %head_record.total_difficulty,
            "Opened chain"
        );

        Ok(Self {
            head: HeadPublisher::new(ChainHead::new(head_block, head_record.total_difficulty)),
            state: Mutex::new(state),
            config,
            calculator,
            store,
            blocks,
            index,
            executor,
            metrics,
        })
    }

    // ========================================================================
    // Lock-free head access
    // ========================================================================

    /// Snapshot of the canonical head
    pub fn head(&self) -> Arc<ChainHead> {
        self.head.current()
    }

    pub fn best_block(&self) -> Arc<Block> {
        self.head.current().block.clone()
    }

    pub fn best_block_hash(&self) -> [u8; 32] {
        self.head.current().hash
    }

    pub fn best_block_number(&self) -> u64 {
        self.head.current().number
    }

    /// Cumulative difficulty of the canonical head
    pub fn total_difficulty(&self) -> U256 {
        self.head.current().total_difficulty
    }

    /// Number of canonical blocks, genesis included
    pub fn size(&self) -> u64 {
        self.head.current().number + 1
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Root of the world state. Waits for an in-flight import.
    pub fn state_root(&self) -> [u8; 32] {
        self.state.lock().root()
    }

    /// Read a world-state value at the head. Waits for an in-flight import.
    pub fn state_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.state.lock().get(key)?)
    }

    pub fn get_block_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.get_block(hash)?)
    }

    /// Canonical block at `number`
    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        match self.index.main_chain_record_at(number)? {
            Some(record) => Ok(self.blocks.get_block(&record.hash)?),
            None => Ok(None),
        }
    }

    pub fn get_receipts(&self, hash: &[u8; 32]) -> Result<Option<Vec<Receipt>>, ChainError> {
        Ok(self.blocks.get_receipts(hash)?)
    }

    pub fn get_record(&self, hash: &[u8; 32]) -> Result<Option<BlockRecord>, ChainError> {
        Ok(self.index.record(hash)?)
    }

    pub fn contains(&self, hash: &[u8; 32]) -> Result<bool, ChainError> {
        Ok(self.index.contains(hash)?)
    }

    pub fn is_main_chain(&self, hash: &[u8; 32]) -> Result<bool, ChainError> {
        Ok(self
            .index
            .record(hash)?
            .map(|record| record.main_chain)
            .unwrap_or(false))
    }

    /// Cumulative difficulty of any indexed block
    pub fn total_difficulty_of(&self, hash: &[u8; 32]) -> Result<Option<U256>, ChainError> {
        Ok(self.index.total_difficulty(hash)?)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn calculator(&self) -> &DifficultyCalculator {
        &self.calculator
    }

    pub fn metrics(&self) -> &ChainMetrics {
        &self.metrics
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Verify and repair the cumulative difficulties in the block index.
    /// Holds the import lock.
    pub fn index_integrity_check(&self) -> Result<IntegrityStatus, ChainError> {
        let _state = self.state.lock();
        let status = self.index.integrity_check(&self.calculator)?;
        if status == IntegrityStatus::Fixed {
            self.metrics.index_repairs.inc();
        }
        info!(status = %status, "Checked block index");
        Ok(status)
    }

    /// Point the chain at the newest ancestor of `head_hash` whose world
    /// state is complete. Returns false, changing nothing, if there is none
    /// or if `head_hash` is not the current head.
    ///
    /// Blocks above the new head stay stored but are no longer canonical;
    /// [`Blockchain::reconnect`] re-executes them.
    pub fn recover_world_state(&self, head_hash: &[u8; 32]) -> bool {
        let mut state = self.state.lock();
        let previous_root = state.committed_root();
        let current = self.head.current();
        if *head_hash != current.hash {
            error!(
                requested = %short_hash(head_hash),
                head = %short_hash(&current.hash),
                "World state recovery must start from the canonical head"
            );
            self.metrics.record_recovery(false);
            return false;
        }
        let recovery = RecoveryManager::new(&self.blocks, &self.index, &self.calculator, &self.config.prune);

        let recovered = match recovery.recover_world_state(&mut state, head_hash) {
            Ok(Some(record)) => self.publish_recovered(&current, &record),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };

        let recovered = match recovered {
            Ok(recovered) => recovered,
            Err(e) => {
                error!(head = %short_hash(head_hash), error = %e, "World state recovery failed");
                state.reset_to(previous_root);
                false
            }
        };
        self.metrics.record_recovery(recovered);
        recovered
    }

    fn publish_recovered(
        &self,
        current: &Arc<ChainHead>,
        record: &BlockRecord,
    ) -> Result<bool, ChainError> {
        if record.hash != current.hash {
            let block = self.blocks.require_block(&record.hash)?;
            self.head
                .publish(current, ChainHead::new(block, record.total_difficulty))?;
            self.metrics.best_block_number.set(record.number as i64);
        }
        Ok(true)
    }

    /// Rebuild the index record of a stored block, and of any ancestors
    /// whose records are missing or wrong. Holds the import lock.
    pub fn recover_index_entry(&self, hash: &[u8; 32]) -> bool {
        let _state = self.state.lock();
        let head_hash = self.head.current().hash;
        let recovery = RecoveryManager::new(&self.blocks, &self.index, &self.calculator, &self.config.prune);

        match recovery.recover_index_entry(hash, &head_hash) {
            Ok(recovered) => recovered,
            Err(e) => {
                error!(block = %short_hash(hash), error = %e, "Index entry recovery failed");
                false
            }
        }
    }
}

/// Refuse to open a store that was initialised with another genesis
fn check_genesis(index: &BlockIndex, genesis: &Genesis) -> Result<(), ChainError> {
    if let Some(stored) = index.main_chain_record_at(0)? {
        let configured = genesis.hash();
        if stored.hash != configured {
            return Err(ChainError::GenesisMismatch {
                stored: short_hash(&stored.hash),
                configured: short_hash(&configured),
            });
        }
    }
    Ok(())
}

/// Write the genesis block, its record and its world state
fn init_genesis(
    store: &Arc<dyn KeyValueStore>,
    blocks: &BlockStore,
    index: &BlockIndex,
    calculator: &DifficultyCalculator,
    genesis: &Genesis,
) -> Result<[u8; 32], ChainError> {
    let block = &genesis.block;
    if !block.is_genesis() {
        return Err(ChainError::InvalidGenesis);
    }

    let mut state = StateAccess::new(store.clone(), EMPTY_ROOT);
    let mut tracker = state.start_tracking();
    for (key, value) in &genesis.alloc {
        tracker.put(key.clone(), value.clone());
    }
    let root = tracker.flush()?;
    if root != block.header.state_root {
        return Err(ChainError::GenesisStateMismatch {
            expected: short_hash(&block.header.state_root),
            actual: short_hash(&root),
        });
    }
    state.commit()?;

    let hash = block.hash();
    let record = BlockRecord::genesis(&block.header, calculator.genesis_totals(block.header.difficulty));
    let mut update = index.begin_update();
    update.append(record)?;

    let mut batch = WriteBatch::new();
    BlockStore::stage_block(&mut batch, block)?;
    BlockStore::stage_receipts(&mut batch, &hash, &[])?;
    BlockStore::stage_best_block(&mut batch, &hash);
    update.stage(&mut batch)?;
    blocks.write(batch)?;

    info!(hash = %short_hash(&hash), entries = genesis.alloc.len(), "Initialized chain with genesis block");
    Ok(hash)
}
