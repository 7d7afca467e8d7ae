// Copyright (c) 2024 Botho Foundation

//! Transaction execution contract.
//!
//! The import engine does not interpret transactions. It hands each block to
//! an [`Executor`] together with a [`StateTracker`] over the parent's state
//! and compares the reported roots with the ones claimed by the header.

use thiserror::Error;

use crate::block::{Block, Receipt};
use crate::state::{StateError, StateTracker};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Transaction {index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    #[error("Energy limit exceeded: used {used}, limit {limit}")]
    EnergyExceeded { used: u64, limit: u64 },

    #[error("State access failed: {0}")]
    State(#[from] StateError),
}

/// What executing a block produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// State root after all transactions
    pub state_root: [u8; 32],
    pub receipts_root: [u8; 32],
    pub transactions_root: [u8; 32],
    pub receipts: Vec<Receipt>,
    pub energy_used: u64,
}

/// Runs a block's transactions against a state snapshot.
///
/// Implementations must be deterministic: the same block over the same state
/// yields the same outcome. Changes go through `state` only; on error the
/// caller discards the tracker, so a failed execution leaves no trace.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        block: &Block,
        state: &mut StateTracker<'_>,
    ) -> Result<ExecutionOutcome, ExecutionError>;
}
