// Copyright (c) 2024 Botho Foundation

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{Blockchain, ChainError};
use crate::block::{short_hash, transactions_root, Block, BlockHeader, Seal, Transaction, EMPTY_ROOT};
use crate::state::StateAccess;

impl Blockchain {
    /// Build a block template on top of `parent`.
    ///
    /// Difficulty, roots and energy are filled in by executing the
    /// transactions against a private view of the parent's state. Nothing is
    /// persisted and the chain's own world state is not touched.
    ///
    /// The parent's state must still be stored. That holds for canonical
    /// blocks (within the prune window) but not for side-branch blocks,
    /// whose states are discarded on import.
    pub fn create_new_block(
        &self,
        parent: &Block,
        transactions: Vec<Transaction>,
        seal: Seal,
        timestamp: u64,
        coinbase: [u8; 32],
    ) -> Result<Block, ChainError> {
        let parent_hash = parent.hash();
        let parent_record = self
            .index
            .record(&parent_hash)?
            .ok_or_else(|| ChainError::UnknownBlock(short_hash(&parent_hash)))?;

        let number = parent.number() + 1;
        let difficulty =
            self.required_difficulty::<ChainError>(number, seal.kind(), &parent_record)?;

        let header = BlockHeader {
            parent_hash,
            number,
            timestamp,
            difficulty,
            coinbase,
            state_root: EMPTY_ROOT,
            tx_root: transactions_root(&transactions),
            receipts_root: EMPTY_ROOT,
            energy_limit: parent.header.energy_limit,
            energy_used: 0,
            extra_data: Vec::new(),
            seal,
        };
        let mut block = Block::new(header, transactions);

        let mut view = StateAccess::new(self.store.clone(), parent.header.state_root);
        if !view.is_valid_root(&parent.header.state_root) {
            return Err(ChainError::StateUnavailable(short_hash(&parent_hash)));
        }
        let mut tracker = view.start_tracking();
        let outcome = self.executor.execute(&block, &mut tracker)?;

        block.header.state_root = outcome.state_root;
        block.header.receipts_root = outcome.receipts_root;
        block.header.energy_used = outcome.energy_used;

        debug!(
            block = %block.description(),
            difficulty,
            transactions = block.transactions.len(),
            "Created block template"
        );
        Ok(block)
    }

    /// [`Blockchain::create_new_block`] on the current head, timestamped now
    /// (or one second after the head if the clock lags behind it).
    ///
    /// Fails with [`ChainError::FutureTimestamp`] once the head has run so
    /// far ahead of the clock that the template would be rejected on import.
    pub fn create_block_on_best(
        &self,
        transactions: Vec<Transaction>,
        seal: Seal,
        coinbase: [u8; 32],
    ) -> Result<Block, ChainError> {
        let parent = self.best_block();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let timestamp = now.max(parent.header.timestamp + 1);
        let limit = now.saturating_add(self.config.max_future_block_secs);
        if timestamp > limit {
            debug!(
                head = %parent.description(),
                timestamp,
                limit,
                "Head is too far ahead of the clock to build on"
            );
            return Err(ChainError::FutureTimestamp { timestamp, limit });
        }
        self.create_new_block(&parent, transactions, seal, timestamp, coinbase)
    }
}
