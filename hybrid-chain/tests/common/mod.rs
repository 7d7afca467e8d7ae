// Copyright (c) 2024 Botho Foundation
//
//! Common test utilities for chain integration tests.
//!
//! # Example
//!
//! ```ignore
//! use common::{open_chain, extend};
//!
//! let test = open_chain(ChainConfig::default());
//! let blocks = extend(&test.chain, 5, 1);
//! assert_eq!(test.chain.best_block_hash(), blocks[4].hash());
//! ```

#![allow(dead_code)]

mod executor;

pub use executor::*;

use std::sync::Arc;

use hybrid_chain::block::{Block, Seal, Transaction};
use hybrid_chain::storage::{Column, KeyValueStore, MemoryStore};
use hybrid_chain::{Blockchain, ChainConfig, ChainError, Genesis, ImportResult};

// ============================================================================
// Constants
// ============================================================================

/// Fixed so independently built chains share a genesis
pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;

pub const GENESIS_DIFFICULTY: u64 = 1024;

pub const GENESIS_ENERGY_LIMIT: u64 = 10_000_000;

/// Seconds between a block and its parent in built chains. Equal to the
/// pre-fork target, so pre-fork difficulty stays at the genesis value.
pub const BLOCK_INTERVAL: u64 = 10;

// ============================================================================
// Chain Setup
// ============================================================================

pub fn genesis() -> Genesis {
    Genesis::new(
        GENESIS_TIMESTAMP,
        GENESIS_DIFFICULTY,
        GENESIS_ENERGY_LIMIT,
        vec![(b"genesis".to_vec(), b"alloc".to_vec())],
    )
    .expect("genesis state can be built")
}

pub struct TestChain {
    pub store: Arc<MemoryStore>,
    pub chain: Blockchain,
}

pub fn open_chain(config: ChainConfig) -> TestChain {
    let store = Arc::new(MemoryStore::new());
    let chain = reopen(&store, config).expect("chain opens");
    TestChain { store, chain }
}

/// Open a chain on an existing store
pub fn reopen(store: &Arc<MemoryStore>, config: ChainConfig) -> Result<Blockchain, ChainError> {
    let store: Arc<dyn KeyValueStore> = store.clone();
    Blockchain::open(config, store, Arc::new(KvExecutor), &genesis())
}

// ============================================================================
// Block Builders
// ============================================================================

pub fn coinbase(tag: u8) -> [u8; 32] {
    [tag; 32]
}

pub fn mining_seal(tag: u8) -> Seal {
    Seal::Mining {
        nonce: [tag; 32],
        solution: vec![tag; 8],
    }
}

pub fn staking_seal(tag: u8) -> Seal {
    Seal::Staking {
        seed: vec![tag; 32],
        signature: vec![tag; 64],
        public_key: [tag; 32],
    }
}

pub fn tx(payload: &str, nonce: u64) -> Transaction {
    Transaction {
        sender: [0xAA; 32],
        nonce,
        energy_limit: 100_000,
        payload: payload.as_bytes().to_vec(),
    }
}

/// Mined child of `parent` paying `coinbase(tag)`
pub fn mined_block(chain: &Blockchain, parent: &Block, tag: u8) -> Block {
    mined_block_with(chain, parent, tag, Vec::new())
}

pub fn mined_block_with(
    chain: &Blockchain,
    parent: &Block,
    tag: u8,
    transactions: Vec<Transaction>,
) -> Block {
    chain
        .create_new_block(
            parent,
            transactions,
            mining_seal(tag),
            parent.header.timestamp + BLOCK_INTERVAL,
            coinbase(tag),
        )
        .expect("block template can be built")
}

/// Staked child of `parent` paying `coinbase(tag)`
pub fn staked_block(chain: &Blockchain, parent: &Block, tag: u8) -> Block {
    chain
        .create_new_block(
            parent,
            Vec::new(),
            staking_seal(tag),
            parent.header.timestamp + BLOCK_INTERVAL,
            coinbase(tag),
        )
        .expect("block template can be built")
}

/// Mine `count` blocks on the head, asserting each becomes the head
pub fn extend(chain: &Blockchain, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let parent = chain.best_block();
        let block = mined_block(chain, &parent, tag);
        assert_eq!(chain.try_to_connect(&block), ImportResult::ImportedBest);
        blocks.push(block);
    }
    blocks
}

/// Mine `count` blocks on `parent` in `chain`, each on the previous one
pub fn build_branch(chain: &Blockchain, parent: &Block, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = parent.clone();
    for _ in 0..count {
        let block = mined_block(chain, &parent, tag);
        assert!(chain.try_to_connect(&block).is_imported());
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

// ============================================================================
// Corruption Helpers
// ============================================================================

/// Remove the root node of a block's world state
pub fn drop_state(store: &MemoryStore, block: &Block) {
    store
        .delete(Column::State, &block.header.state_root)
        .expect("delete succeeds");
}

pub fn balance(chain: &Blockchain, tag: u8) -> u64 {
    chain
        .state_value(&balance_key(&coinbase(tag)))
        .expect("state readable")
        .map(|bytes| decode_balance(&bytes))
        .unwrap_or(0)
}
