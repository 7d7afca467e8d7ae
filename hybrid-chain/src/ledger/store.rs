// Copyright (c) 2024 Botho Foundation

use std::sync::Arc;

use super::LedgerError;
use crate::block::{Block, BlockHeader, Receipt};
use crate::storage::{decode, encode, Column, KeyValueStore, WriteBatch};

// Metadata keys
const META_BEST_BLOCK: &[u8] = b"best_block";

/// Block bodies, receipts and the persisted best-block pointer.
///
/// Blocks are keyed by hash, so every known branch is kept. Which of them is
/// canonical is the [`BlockIndex`](super::BlockIndex)'s business.
pub struct BlockStore {
    store: Arc<dyn KeyValueStore>,
}

impl BlockStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &[u8; 32]) -> Result<Option<Block>, LedgerError> {
        match self.store.get(Column::Blocks, hash)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a block that the index says must exist
    pub fn require_block(&self, hash: &[u8; 32]) -> Result<Block, LedgerError> {
        self.get_block(hash)?
            .ok_or(LedgerError::BlockNotFound(*hash))
    }

    pub fn get_header(&self, hash: &[u8; 32]) -> Result<Option<BlockHeader>, LedgerError> {
        Ok(self.get_block(hash)?.map(|block| block.header))
    }

    pub fn contains_block(&self, hash: &[u8; 32]) -> Result<bool, LedgerError> {
        Ok(self.store.contains(Column::Blocks, hash)?)
    }

    /// Receipts produced when the block was executed
    pub fn get_receipts(&self, hash: &[u8; 32]) -> Result<Option<Vec<Receipt>>, LedgerError> {
        match self.store.get(Column::Receipts, hash)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hash of the persisted canonical head
    pub fn best_block_hash(&self) -> Result<Option<[u8; 32]>, LedgerError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK)? {
            Some(bytes) => {
                let hash: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LedgerError::Corrupted("best block pointer".to_string()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Stage a block body
    pub fn stage_block(batch: &mut WriteBatch, block: &Block) -> Result<(), LedgerError> {
        batch.put(Column::Blocks, block.hash().to_vec(), encode(block)?);
        Ok(())
    }

    /// Stage the receipts of a block
    pub fn stage_receipts(
        batch: &mut WriteBatch,
        hash: &[u8; 32],
        receipts: &[Receipt],
    ) -> Result<(), LedgerError> {
        batch.put(Column::Receipts, hash.to_vec(), encode(&receipts)?);
        Ok(())
    }

    /// Stage a new best-block pointer
    pub fn stage_best_block(batch: &mut WriteBatch, hash: &[u8; 32]) {
        batch.put(Column::Meta, META_BEST_BLOCK, hash.to_vec());
    }

    pub fn write(&self, batch: WriteBatch) -> Result<(), LedgerError> {
        Ok(self.store.write(batch)?)
    }
}
