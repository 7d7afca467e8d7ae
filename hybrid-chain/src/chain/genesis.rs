// Copyright (c) 2024 Botho Foundation

use crate::block::{Block, BlockHeader, Seal, EMPTY_ROOT};
use crate::state::{StateAccess, StateError};

/// Genesis block plus the world state it commits to.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub block: Block,
    /// Initial key/value entries of the world state
    pub alloc: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Genesis {
    /// Build a genesis block whose state root matches `alloc`
    pub fn new(
        timestamp: u64,
        difficulty: u64,
        energy_limit: u64,
        alloc: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Self, StateError> {
        let state_root = StateAccess::root_of(alloc.iter().cloned())?;
        let header = BlockHeader {
            parent_hash: [0u8; 32],
            number: 0,
            timestamp,
            difficulty,
            coinbase: [0u8; 32],
            state_root,
            tx_root: EMPTY_ROOT,
            receipts_root: EMPTY_ROOT,
            energy_limit,
            energy_used: 0,
            extra_data: b"genesis".to_vec(),
            seal: Seal::empty_mining(),
        };
        Ok(Self {
            block: Block::new(header, Vec::new()),
            alloc,
        })
    }

    pub fn hash(&self) -> [u8; 32] {
        self.block.hash()
    }
}
