// Copyright (c) 2024 Botho Foundation
//
//! LMDB Persistence Integration Tests
//!
//! Runs the chain on the on-disk store and checks that head, branches and
//! world state survive closing and reopening the environment.

mod common;

use std::path::Path;
use std::sync::Arc;

use serial_test::serial;
use tempfile::tempdir;

use common::*;
use hybrid_chain::storage::{KeyValueStore, LmdbStore};
use hybrid_chain::{Blockchain, ChainConfig, ChainError, ImportResult};

const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

fn open_lmdb(path: &Path, config: ChainConfig) -> Result<Blockchain, ChainError> {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(LmdbStore::open_with_map_size(path, TEST_MAP_SIZE).expect("lmdb opens"));
    Blockchain::open(config, store, Arc::new(KvExecutor), &genesis())
}

#[test]
#[serial]
fn test_chain_survives_reopen() {
    let dir = tempdir().unwrap();

    let (head, td, state_root) = {
        let chain = open_lmdb(dir.path(), ChainConfig::default()).unwrap();
        let parent = chain.best_block();
        let block = mined_block_with(&chain, &parent, 1, vec![tx("name=lmdb", 0)]);
        assert_eq!(chain.try_to_connect(&block), ImportResult::ImportedBest);
        extend(&chain, 4, 1);
        (
            chain.best_block_hash(),
            chain.total_difficulty(),
            chain.state_root(),
        )
    };

    let chain = open_lmdb(dir.path(), ChainConfig::default()).unwrap();
    assert_eq!(chain.best_block_hash(), head);
    assert_eq!(chain.best_block_number(), 5);
    assert_eq!(chain.total_difficulty(), td);
    assert_eq!(chain.state_root(), state_root);
    assert_eq!(
        chain.state_value(b"name").unwrap(),
        Some(b"lmdb".to_vec())
    );
    assert_eq!(balance(&chain, 1), 5 * BLOCK_REWARD);

    // Imports continue from the persisted head
    extend(&chain, 1, 1);
    assert_eq!(chain.best_block_number(), 6);
}

#[test]
#[serial]
fn test_side_branch_survives_reopen() {
    let dir = tempdir().unwrap();

    let sibling = {
        let chain = open_lmdb(dir.path(), ChainConfig::default()).unwrap();
        let genesis_block = chain.best_block();
        extend(&chain, 2, 1);
        let sibling = mined_block(&chain, &genesis_block, 2);
        assert_eq!(
            chain.try_to_connect(&sibling),
            ImportResult::ImportedNotBest
        );
        sibling
    };

    let chain = open_lmdb(dir.path(), ChainConfig::default()).unwrap();
    assert_eq!(chain.try_to_connect(&sibling), ImportResult::Exist);
    assert!(!chain.is_main_chain(&sibling.hash()).unwrap());
    assert!(chain.get_receipts(&sibling.hash()).unwrap().is_some());
}

#[test]
#[serial]
fn test_reopen_with_other_genesis_fails() {
    let dir = tempdir().unwrap();
    {
        let chain = open_lmdb(dir.path(), ChainConfig::default()).unwrap();
        extend(&chain, 1, 1);
    }

    let store: Arc<dyn KeyValueStore> =
        Arc::new(LmdbStore::open_with_map_size(dir.path(), TEST_MAP_SIZE).unwrap());
    let other = hybrid_chain::Genesis::new(GENESIS_TIMESTAMP + 1, GENESIS_DIFFICULTY, GENESIS_ENERGY_LIMIT, Vec::new())
        .unwrap();
    let result = Blockchain::open(ChainConfig::default(), store, Arc::new(KvExecutor), &other);
    assert!(matches!(result, Err(ChainError::GenesisMismatch { .. })));
}
