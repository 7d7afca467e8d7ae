// Copyright (c) 2024 Botho Foundation

//! Lock-free publication of the canonical head.
//!
//! Readers get the last published [`ChainHead`] as one consistent snapshot
//! (block, number and total difficulty together) without touching the import
//! lock. Writers swap in a new snapshot only if the one they started from is
//! still current.

use arc_swap::ArcSwap;
use primitive_types::U256;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::block::{short_hash, Block};

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("Head moved from {expected} to {actual} during the update")]
    Superseded { expected: String, actual: String },
}

/// Immutable snapshot of the canonical head.
#[derive(Debug, Clone)]
pub struct ChainHead {
    pub block: Arc<Block>,
    pub hash: [u8; 32],
    pub number: u64,
    pub total_difficulty: U256,
}

impl ChainHead {
    pub fn new(block: Block, total_difficulty: U256) -> Self {
        Self {
            hash: block.hash(),
            number: block.number(),
            block: Arc::new(block),
            total_difficulty,
        }
    }

    /// State root the world state must be at while this is the head
    pub fn state_root(&self) -> [u8; 32] {
        self.block.header.state_root
    }
}

pub struct HeadPublisher {
    current: ArcSwap<ChainHead>,
}

impl HeadPublisher {
    pub fn new(head: ChainHead) -> Self {
        Self {
            current: ArcSwap::from_pointee(head),
        }
    }

    /// The last published head
    pub fn current(&self) -> Arc<ChainHead> {
        self.current.load_full()
    }

    /// Replace `expected` with `next`. Fails without changing anything if
    /// another head was published in between.
    pub fn publish(
        &self,
        expected: &Arc<ChainHead>,
        next: ChainHead,
    ) -> Result<Arc<ChainHead>, HeadError> {
        let next = Arc::new(next);
        let previous = self.current.compare_and_swap(expected, Arc::clone(&next));
        if !Arc::ptr_eq(&previous, expected) {
            return Err(HeadError::Superseded {
                expected: short_hash(&expected.hash),
                actual: short_hash(&previous.hash),
            });
        }
        debug!(
            number = next.number,
            hash = %short_hash(&next.hash),
            total_difficulty = %next.total_difficulty,
            "Published head"
        );
        Ok(next)
    }
}
