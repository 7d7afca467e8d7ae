// Copyright (c) 2024 Botho Foundation

//! Repair of a chain whose world state or index lost data.
//!
//! World-state recovery walks back from the head to the newest block whose
//! state is complete (and not subject to pruning) and makes it the head.
//! Index recovery recomputes records from the stored blocks.

use std::collections::HashSet;
use tracing::{error, info, warn};

use crate::block::{short_hash, Block};
use crate::chain::ChainError;
use crate::difficulty::DifficultyCalculator;
use crate::ledger::{BlockIndex, BlockRecord, BlockStore, IndexError};
use crate::state::{PruneConfig, StateAccess};
use crate::storage::WriteBatch;

pub struct RecoveryManager<'a> {
    blocks: &'a BlockStore,
    index: &'a BlockIndex,
    calculator: &'a DifficultyCalculator,
    prune: &'a PruneConfig,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        blocks: &'a BlockStore,
        index: &'a BlockIndex,
        calculator: &'a DifficultyCalculator,
        prune: &'a PruneConfig,
    ) -> Self {
        Self {
            blocks,
            index,
            calculator,
            prune,
        }
    }

    /// Newest block at or below `head_hash` whose state is complete and may
    /// be relied on under the prune policy
    pub fn find_recoverable_ancestor(
        &self,
        state: &StateAccess,
        head_hash: &[u8; 32],
    ) -> Result<Option<Block>, ChainError> {
        let head = self.blocks.require_block(head_hash)?;
        let current_height = head.number();

        let mut cursor = head;
        for _ in 0..=current_height {
            let restricted = self.prune.is_prune_restricted(cursor.number(), current_height);
            if !restricted && state.is_valid_root(&cursor.header.state_root) {
                return Ok(Some(cursor));
            }
            if cursor.is_genesis() {
                break;
            }
            match self.blocks.get_block(&cursor.parent_hash())? {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        Ok(None)
    }

    /// Make the newest recoverable ancestor of `head_hash` the head.
    ///
    /// On success the canonical flags above it are cleared, the best-block
    /// pointer is rewritten and `state` is synced to its root; the new head's
    /// record is returned. Returns `None` and changes nothing if no ancestor
    /// qualifies. `head_hash` must be a canonical block: walking down from a
    /// side branch would clear flags that belong to the main chain.
    pub fn recover_world_state(
        &self,
        state: &mut StateAccess,
        head_hash: &[u8; 32],
    ) -> Result<Option<BlockRecord>, ChainError> {
        if let Some(head) = self.index.record(head_hash)? {
            if !head.main_chain {
                return Err(ChainError::NotCanonical(short_hash(head_hash)));
            }
        }

        let Some(target) = self.find_recoverable_ancestor(state, head_hash)? else {
            error!(head = %short_hash(head_hash), "No ancestor with a complete world state");
            return Ok(None);
        };

        let target_hash = target.hash();
        let mut record = self
            .index
            .record(&target_hash)?
            .ok_or_else(|| ChainError::UnknownBlock(short_hash(&target_hash)))?;

        if target_hash == *head_hash {
            state.sync_to_root(&target.header.state_root)?;
            return Ok(Some(record));
        }

        let mut update = self.index.begin_update();
        let mut cursor = *head_hash;
        let mut abandoned = 0usize;
        while cursor != target_hash {
            let block = self.blocks.require_block(&cursor)?;
            if let Some(stale) = self.index.record(&cursor)? {
                update.set_main_chain(&stale.hash, stale.number, false)?;
                abandoned += 1;
            }
            cursor = block.parent_hash();
        }
        update.set_main_chain(&target_hash, record.number, true)?;

        let mut batch = WriteBatch::new();
        update.stage(&mut batch)?;
        BlockStore::stage_best_block(&mut batch, &target_hash);

        state.sync_to_root(&target.header.state_root)?;
        self.blocks.write(batch)?;

        warn!(
            old_head = %short_hash(head_hash),
            new_head = %target.description(),
            abandoned,
            "Recovered world state at an earlier block"
        );
        record.main_chain = true;
        Ok(Some(record))
    }

    /// Rebuild the record of the stored block `hash` and of every ancestor
    /// down to the first one with a correct record. Canonical flags follow
    /// the chain ending at `head_hash`.
    pub fn recover_index_entry(
        &self,
        hash: &[u8; 32],
        head_hash: &[u8; 32],
    ) -> Result<bool, ChainError> {
        let Some(target) = self.blocks.get_block(hash)? else {
            warn!(block = %short_hash(hash), "Cannot rebuild index entry of an unknown block");
            return Ok(false);
        };

        // Collect blocks needing a record, newest first
        let mut rebuild: Vec<Block> = Vec::new();
        let mut anchor: Option<BlockRecord> = None;
        let mut cursor = target;
        for _ in 0..=cursor.number() {
            if let Some(record) = self.index.record(&cursor.hash())? {
                let consistent = match self.index.is_consistent(&record.hash, self.calculator) {
                    Ok(consistent) => consistent,
                    Err(IndexError::ParentNotIndexed { .. }) => false,
                    Err(e) => return Err(e.into()),
                };
                if consistent {
                    anchor = Some(record);
                    break;
                }
            }

            let parent_hash = cursor.parent_hash();
            let genesis = cursor.is_genesis();
            rebuild.push(cursor);
            if genesis {
                break;
            }
            match self.blocks.get_block(&parent_hash)? {
                Some(parent) => cursor = parent,
                None => {
                    warn!(parent = %short_hash(&parent_hash), "Ancestor block is missing");
                    return Ok(false);
                }
            }
        }

        if rebuild.is_empty() {
            return Ok(true);
        }
        let lowest = rebuild.last().map(|block| block.number()).unwrap_or(0);
        let canonical = self.canonical_hashes(head_hash, lowest)?;

        let mut update = self.index.begin_update();
        let mut parent = anchor;
        for block in rebuild.iter().rev() {
            let header = &block.header;
            let mut record = match &parent {
                Some(parent) => {
                    let totals = self.calculator.accumulate(
                        &parent.totals(),
                        header.number,
                        header.seal_kind(),
                        header.difficulty,
                    );
                    BlockRecord::child(header, parent, totals)
                }
                None => BlockRecord::genesis(header, self.calculator.genesis_totals(header.difficulty)),
            };
            record.main_chain = canonical.contains(&record.hash);
            update.put_record(record.clone())?;
            parent = Some(record);
        }

        let mut batch = WriteBatch::new();
        update.stage(&mut batch)?;
        self.blocks.write(batch)?;

        info!(
            block = %short_hash(hash),
            rebuilt = rebuild.len(),
            "Rebuilt index entries"
        );
        Ok(true)
    }

    /// Hashes on the chain ending at `head_hash`, down to height `lowest`
    fn canonical_hashes(
        &self,
        head_hash: &[u8; 32],
        lowest: u64,
    ) -> Result<HashSet<[u8; 32]>, ChainError> {
        let mut hashes = HashSet::new();
        let mut cursor = self.blocks.get_block(head_hash)?;
        while let Some(block) = cursor {
            if block.number() < lowest {
                break;
            }
            hashes.insert(block.hash());
            if block.is_genesis() {
                break;
            }
            cursor = self.blocks.get_block(&block.parent_hash())?;
        }
        Ok(hashes)
    }
}
