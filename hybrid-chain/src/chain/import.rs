// Copyright (c) 2024 Botho Foundation

//! `try_to_connect`: validation, positioning, execution and head selection.
//!
//! An import moves through [`ImportStage`]s in order. Each stage is a gate;
//! failing any of them sends the block down a single rollback path that
//! restores the world state to the head's root and leaves the ledger as it
//! was. Only a block that passes every gate is persisted, and the ledger
//! writes for it go out as one batch.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::{Blockchain, ImportResult};
use crate::block::{
    receipts_root, short_hash, transactions_root, Block, BlockHeader, Seal, SealKind,
    MAX_EXTRA_DATA_LEN,
};
use crate::difficulty::{DifficultyError, SealAncestors};
use crate::executor::{ExecutionError, ExecutionOutcome};
use crate::head::{ChainHead, HeadError};
use crate::ledger::{BlockRecord, BlockStore, IndexError, IndexUpdate, LedgerError};
use crate::state::{StateAccess, StateError};
use crate::storage::{StoreError, WriteBatch};

/// Progress of a block through the import state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Received,
    StructurallyValidated,
    Positioned,
    Executed,
    Committed,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportStage::Received => "received",
            ImportStage::StructurallyValidated => "structurally_validated",
            ImportStage::Positioned => "positioned",
            ImportStage::Executed => "executed",
            ImportStage::Committed => "committed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    State,
    Receipts,
    Transactions,
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootKind::State => write!(f, "state"),
            RootKind::Receipts => write!(f, "receipts"),
            RootKind::Transactions => write!(f, "transactions"),
        }
    }
}

/// Why a block was rejected.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Parent {0} is unknown")]
    UnknownParent(String),

    #[error("Block {0} is not indexed")]
    UnknownBlock(String),

    #[error("Expected height {expected}, got {got}")]
    WrongNumber { expected: u64, got: u64 },

    #[error("Timestamp {timestamp} is not after parent timestamp {parent}")]
    TimestampNotAfterParent { timestamp: u64, parent: u64 },

    #[error("Timestamp {timestamp} is more than {max_future}s ahead of local time {now}")]
    FutureTimestamp {
        timestamp: u64,
        now: u64,
        max_future: u64,
    },

    #[error("Extra data is {0} bytes")]
    ExtraDataTooLong(usize),

    #[error("Energy used {used} exceeds energy limit {limit}")]
    EnergyAboveLimit { used: u64, limit: u64 },

    #[error("Staking seal is missing its seed or signature")]
    MalformedSeal,

    #[error(transparent)]
    Difficulty(#[from] DifficultyError),

    #[error("Wrong difficulty: expected {expected}, got {got}")]
    WrongDifficulty { expected: u64, got: u64 },

    #[error("Fork is deeper than the reorg limit of {0} blocks")]
    ReorgTooDeep(u64),

    #[error("Canonical chain does not lead back to block #{0}")]
    BrokenCanonicalChain(u64),

    #[error("World state of common ancestor #{0} is not available")]
    AncestorStateUnavailable(u64),

    #[error("Replay of block #{number} failed: {source}")]
    Replay {
        number: u64,
        #[source]
        source: Box<ImportError>,
    },

    #[error("Execution of block #{number} failed: {source}")]
    Execution {
        number: u64,
        #[source]
        source: ExecutionError,
    },

    #[error("{kind} root mismatch: header {expected}, computed {actual}")]
    RootMismatch {
        kind: RootKind,
        expected: String,
        actual: String,
    },

    #[error("Energy used mismatch: header {expected}, executed {actual}")]
    EnergyUsedMismatch { expected: u64, actual: u64 },

    #[error("System clock is before the unix epoch")]
    Clock,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Head(#[from] HeadError),
}

/// How a block's parent relates to the canonical chain.
struct Route {
    /// Canonical block the branch forks from
    ancestor: BlockRecord,
    /// Side-branch records above the ancestor, lowest first
    branch: Vec<BlockRecord>,
    /// Canonical records above the ancestor, head first
    abandoned: Vec<BlockRecord>,
}

impl Route {
    fn is_extension(&self) -> bool {
        self.branch.is_empty() && self.abandoned.is_empty()
    }
}

fn check_root(kind: RootKind, expected: [u8; 32], actual: [u8; 32]) -> Result<(), ImportError> {
    if expected != actual {
        return Err(ImportError::RootMismatch {
            kind,
            expected: short_hash(&expected),
            actual: short_hash(&actual),
        });
    }
    Ok(())
}

fn unix_now() -> Result<u64, ImportError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ImportError::Clock)
}

impl Blockchain {
    /// Validate, execute and store `block`, switching the canonical head if
    /// it makes the heaviest chain.
    ///
    /// Imports are serialized by the import lock. Whatever the outcome, the
    /// world state afterwards is committed at the (possibly new) head's root.
    pub fn try_to_connect(&self, block: &Block) -> ImportResult {
        let started = Instant::now();
        let mut state = self.state.lock();
        let snapshot = state.committed_root();
        let mut stage = ImportStage::Received;

        let result = match self.import_block(&mut state, block, &mut stage) {
            Ok(result) => result,
            Err(e) => {
                state.reset_to(snapshot);
                warn!(
                    block = %block.description(),
                    stage = %stage,
                    error = %e,
                    "Rejected block"
                );
                ImportResult::InvalidBlock
            }
        };
        drop(state);

        self.metrics.record_import(result, started.elapsed());
        result
    }

    /// Re-execute the stored side branch ending at `tip` and make it
    /// canonical if it is heavier than the head. Used after a world-state
    /// recovery left executed blocks above the head.
    pub fn reconnect(&self, tip: &[u8; 32]) -> ImportResult {
        let started = Instant::now();
        let mut state = self.state.lock();
        let snapshot = state.committed_root();

        let result = match self.reconnect_branch(&mut state, tip) {
            Ok(result) => result,
            Err(e) => {
                state.reset_to(snapshot);
                warn!(tip = %short_hash(tip), error = %e, "Failed to reconnect branch");
                ImportResult::InvalidBlock
            }
        };
        drop(state);

        self.metrics.record_import(result, started.elapsed());
        result
    }

    fn import_block(
        &self,
        state: &mut StateAccess,
        block: &Block,
        stage: &mut ImportStage,
    ) -> Result<ImportResult, ImportError> {
        let hash = block.hash();
        if self.index.contains(&hash)? {
            debug!(block = %block.description(), "Block already known");
            return Ok(ImportResult::Exist);
        }

        let parent = self
            .index
            .record(&block.parent_hash())?
            .ok_or_else(|| ImportError::UnknownParent(short_hash(&block.parent_hash())))?;
        let parent_header = self.blocks.require_block(&parent.hash)?.header;
        self.validate_header(&block.header, &parent_header, &parent)?;
        *stage = ImportStage::StructurallyValidated;

        let head = self.head.current();
        debug_assert_eq!(state.committed_root(), head.state_root());
        let route = self.route_to(&parent, &head)?;
        if !route.is_extension() {
            self.position_on_branch(state, &route)?;
        }
        *stage = ImportStage::Positioned;
        trace!(block = %block.description(), ancestor = route.ancestor.number, "Positioned block");

        let outcome = self.execute_and_verify(state, block)?;
        *stage = ImportStage::Executed;

        let totals = self.calculator.accumulate(
            &parent.totals(),
            block.number(),
            block.seal_kind(),
            block.header.difficulty,
        );
        let mut record = BlockRecord::child(&block.header, &parent, totals);

        let mut batch = WriteBatch::new();
        BlockStore::stage_block(&mut batch, block)?;
        BlockStore::stage_receipts(&mut batch, &hash, &outcome.receipts)?;
        let mut update = self.index.begin_update();

        if totals.total > head.total_difficulty {
            record.main_chain = true;
            update.append(record)?;
            self.adopt(
                state,
                &head,
                &route,
                update,
                batch,
                ChainHead::new(block.clone(), totals.total),
            )?;
            *stage = ImportStage::Committed;

            info!(
                block = %block.description(),
                total_difficulty = %totals.total,
                transactions = block.transactions.len(),
                "Imported best block"
            );
            Ok(ImportResult::ImportedBest)
        } else {
            update.append(record)?;
            update.stage(&mut batch)?;
            self.blocks.write(batch)?;
            // The side branch's state is not kept
            state.reset_to(head.state_root());
            *stage = ImportStage::Committed;

            debug!(
                block = %block.description(),
                total_difficulty = %totals.total,
                head_total_difficulty = %head.total_difficulty,
                "Imported side-branch block"
            );
            Ok(ImportResult::ImportedNotBest)
        }
    }

    fn reconnect_branch(
        &self,
        state: &mut StateAccess,
        tip_hash: &[u8; 32],
    ) -> Result<ImportResult, ImportError> {
        let tip = self
            .index
            .record(tip_hash)?
            .ok_or_else(|| ImportError::UnknownBlock(short_hash(tip_hash)))?;
        if tip.main_chain {
            return Ok(ImportResult::Exist);
        }

        let head = self.head.current();
        let route = self.route_to(&tip, &head)?;
        self.position_on_branch(state, &route)?;

        if tip.total_difficulty <= head.total_difficulty {
            state.reset_to(head.state_root());
            return Ok(ImportResult::ImportedNotBest);
        }

        let block = self.blocks.require_block(tip_hash)?;
        self.adopt(
            state,
            &head,
            &route,
            self.index.begin_update(),
            WriteBatch::new(),
            ChainHead::new(block, tip.total_difficulty),
        )?;
        info!(
            tip = %short_hash(tip_hash),
            number = tip.number,
            replayed = route.branch.len(),
            "Reconnected branch"
        );
        Ok(ImportResult::ImportedBest)
    }

    /// Structural and difficulty checks against the parent
    fn validate_header(
        &self,
        header: &BlockHeader,
        parent_header: &BlockHeader,
        parent: &BlockRecord,
    ) -> Result<(), ImportError> {
        if header.number != parent.number + 1 {
            return Err(ImportError::WrongNumber {
                expected: parent.number + 1,
                got: header.number,
            });
        }
        if header.extra_data.len() > MAX_EXTRA_DATA_LEN {
            return Err(ImportError::ExtraDataTooLong(header.extra_data.len()));
        }
        if header.energy_used > header.energy_limit {
            return Err(ImportError::EnergyAboveLimit {
                used: header.energy_used,
                limit: header.energy_limit,
            });
        }
        if header.timestamp <= parent_header.timestamp {
            return Err(ImportError::TimestampNotAfterParent {
                timestamp: header.timestamp,
                parent: parent_header.timestamp,
            });
        }
        let now = unix_now()?;
        if header.timestamp > now.saturating_add(self.config.max_future_block_secs) {
            return Err(ImportError::FutureTimestamp {
                timestamp: header.timestamp,
                now,
                max_future: self.config.max_future_block_secs,
            });
        }
        if let Seal::Staking {
            seed, signature, ..
        } = &header.seal
        {
            if seed.is_empty() || signature.is_empty() {
                return Err(ImportError::MalformedSeal);
            }
        }

        let expected = self.required_difficulty::<ImportError>(
            header.number,
            header.seal_kind(),
            parent,
        )?;
        if header.difficulty != expected {
            return Err(ImportError::WrongDifficulty {
                expected,
                got: header.difficulty,
            });
        }
        Ok(())
    }

    /// Difficulty a child of `parent` at `number` sealed as `kind` must claim
    pub(super) fn required_difficulty<E>(
        &self,
        number: u64,
        kind: SealKind,
        parent: &BlockRecord,
    ) -> Result<u64, E>
    where
        E: From<LedgerError> + From<IndexError> + From<DifficultyError>,
    {
        let seal_parent = match parent.latest_of(kind) {
            Some(hash) => Some(self.blocks.require_block(&hash)?.header),
            None => None,
        };

        let seal_grandparent = match &seal_parent {
            Some(seal_parent) if !seal_parent.is_genesis() => {
                let latest = self
                    .index
                    .record(&seal_parent.parent_hash)?
                    .and_then(|record| record.latest_of(kind));
                match latest {
                    Some(hash) => Some(self.blocks.require_block(&hash)?.header),
                    None => None,
                }
            }
            _ => None,
        };

        let ancestors = SealAncestors {
            parent: seal_parent.as_ref(),
            grandparent: seal_grandparent.as_ref(),
        };
        Ok(self.calculator.required_difficulty(number, kind, ancestors)?)
    }

    /// Find where `tip` joins the canonical chain
    fn route_to(&self, tip: &BlockRecord, head: &ChainHead) -> Result<Route, ImportError> {
        let limit = self.config.max_reorg_depth;

        let mut branch = Vec::new();
        let mut cursor = tip.clone();
        while !cursor.main_chain {
            if branch.len() as u64 >= limit {
                return Err(ImportError::ReorgTooDeep(limit));
            }
            let parent = self
                .index
                .record(&cursor.parent_hash)?
                .ok_or_else(|| ImportError::UnknownParent(short_hash(&cursor.parent_hash)))?;
            branch.push(cursor);
            cursor = parent;
        }
        let ancestor = cursor;
        branch.reverse();

        let mut abandoned = Vec::new();
        let mut cursor_hash = head.hash;
        while cursor_hash != ancestor.hash {
            if abandoned.len() as u64 >= limit {
                return Err(ImportError::ReorgTooDeep(limit));
            }
            let record = self
                .index
                .record(&cursor_hash)?
                .ok_or_else(|| ImportError::UnknownBlock(short_hash(&cursor_hash)))?;
            if record.number <= ancestor.number {
                return Err(ImportError::BrokenCanonicalChain(ancestor.number));
            }
            cursor_hash = record.parent_hash;
            abandoned.push(record);
        }

        Ok(Route {
            ancestor,
            branch,
            abandoned,
        })
    }

    /// Move the world state to the ancestor and replay the side branch on it
    fn position_on_branch(&self, state: &mut StateAccess, route: &Route) -> Result<(), ImportError> {
        let ancestor = self.blocks.require_block(&route.ancestor.hash)?;
        state
            .sync_to_root(&ancestor.header.state_root)
            .map_err(|_| ImportError::AncestorStateUnavailable(route.ancestor.number))?;

        for record in &route.branch {
            let replayed = self.blocks.require_block(&record.hash)?;
            self.execute_and_verify(state, &replayed)
                .map_err(|e| ImportError::Replay {
                    number: record.number,
                    source: Box::new(e),
                })?;
        }

        debug!(
            ancestor = route.ancestor.number,
            replayed = route.branch.len(),
            "Positioned state on side branch"
        );
        Ok(())
    }

    /// Run `block` through the executor and check the results against its
    /// header. Leaves the new root as the working root of `state`.
    fn execute_and_verify(
        &self,
        state: &mut StateAccess,
        block: &Block,
    ) -> Result<ExecutionOutcome, ImportError> {
        let header = &block.header;

        let mut tracker = state.start_tracking();
        let outcome = self
            .executor
            .execute(block, &mut tracker)
            .map_err(|source| ImportError::Execution {
                number: header.number,
                source,
            })?;
        let state_root = tracker.flush()?;

        check_root(
            RootKind::Transactions,
            header.tx_root,
            transactions_root(&block.transactions),
        )?;
        check_root(RootKind::Transactions, header.tx_root, outcome.transactions_root)?;
        check_root(RootKind::Receipts, header.receipts_root, outcome.receipts_root)?;
        check_root(
            RootKind::Receipts,
            header.receipts_root,
            receipts_root(&outcome.receipts),
        )?;
        check_root(RootKind::State, header.state_root, outcome.state_root)?;
        check_root(RootKind::State, header.state_root, state_root)?;

        if outcome.energy_used != header.energy_used {
            return Err(ImportError::EnergyUsedMismatch {
                expected: header.energy_used,
                actual: outcome.energy_used,
            });
        }
        Ok(outcome)
    }

    /// Make `route.branch` plus the records staged in `update` canonical,
    /// with `next` as the head. Commits the world state, writes the ledger
    /// in one batch, then publishes the head.
    fn adopt(
        &self,
        state: &mut StateAccess,
        head: &Arc<ChainHead>,
        route: &Route,
        mut update: IndexUpdate<'_>,
        mut batch: WriteBatch,
        next: ChainHead,
    ) -> Result<(), ImportError> {
        for record in &route.abandoned {
            update.set_main_chain(&record.hash, record.number, false)?;
        }
        for record in &route.branch {
            update.set_main_chain(&record.hash, record.number, true)?;
        }
        update.stage(&mut batch)?;
        BlockStore::stage_best_block(&mut batch, &next.hash);

        state.commit()?;
        self.blocks.write(batch)?;

        let number = next.number;
        let new_hash = next.hash;
        self.head.publish(head, next)?;
        self.metrics.best_block_number.set(number as i64);

        if !route.abandoned.is_empty() {
            self.metrics.record_reorg(route.abandoned.len() as u64);
            info!(
                old_head = %short_hash(&head.hash),
                new_head = %short_hash(&new_hash),
                ancestor = route.ancestor.number,
                abandoned = route.abandoned.len(),
                replayed = route.branch.len(),
                "Switched canonical branch"
            );
        }
        Ok(())
    }
}
