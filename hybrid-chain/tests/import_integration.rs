// Copyright (c) 2024 Botho Foundation
//
//! Block Import Integration Tests
//!
//! Covers the import state machine end to end:
//! - Head advancement and cumulative difficulty growth
//! - Duplicate and unknown-parent handling
//! - Every rejection path leaving the chain untouched
//! - Side branches and reorganisations with state replay

mod common;

use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::U256;

use common::*;
use hybrid_chain::block::{transactions_root, Block};
use hybrid_chain::{ChainConfig, ChainError, ImportResult};

/// Everything observable about the canonical head
#[derive(Debug, PartialEq)]
struct Snapshot {
    best: [u8; 32],
    size: u64,
    total_difficulty: U256,
    state_root: [u8; 32],
}

fn snapshot(test: &TestChain) -> Snapshot {
    Snapshot {
        best: test.chain.best_block_hash(),
        size: test.chain.size(),
        total_difficulty: test.chain.total_difficulty(),
        state_root: test.chain.state_root(),
    }
}

/// Import `block` and assert it is rejected without side effects
fn assert_rejected(test: &TestChain, block: &Block) {
    let before = snapshot(test);
    assert_eq!(test.chain.try_to_connect(block), ImportResult::InvalidBlock);
    assert_eq!(snapshot(test), before);
    assert!(!test.chain.contains(&block.hash()).unwrap());
    assert!(test.chain.get_block_by_hash(&block.hash()).unwrap().is_none());
}

// ============================================================================
// Head Advancement
// ============================================================================

#[test]
fn test_extending_head_increases_size_and_difficulty() {
    let test = open_chain(ChainConfig::default());
    assert_eq!(test.chain.size(), 1);
    assert_eq!(test.chain.total_difficulty(), U256::from(GENESIS_DIFFICULTY));

    let mut previous_td = test.chain.total_difficulty();
    for i in 1..=10u64 {
        let parent = test.chain.best_block();
        let block = mined_block(&test.chain, &parent, 1);
        assert_eq!(test.chain.try_to_connect(&block), ImportResult::ImportedBest);

        assert_eq!(test.chain.size(), i + 1);
        assert_eq!(test.chain.best_block_hash(), block.hash());
        assert!(test.chain.total_difficulty() > previous_td);
        assert_eq!(test.chain.state_root(), block.header.state_root);
        previous_td = test.chain.total_difficulty();
    }

    assert_eq!(balance(&test.chain, 1), 10 * BLOCK_REWARD);
    assert_eq!(
        test.chain.metrics().import_count(ImportResult::ImportedBest),
        10
    );
}

#[test]
fn test_canonical_lookup_by_number() {
    let test = open_chain(ChainConfig::default());
    let blocks = extend(&test.chain, 5, 1);

    for block in &blocks {
        assert!(test.chain.is_main_chain(&block.hash()).unwrap());
        assert_eq!(
            test.chain.get_block_by_number(block.number()).unwrap(),
            Some(block.clone())
        );
    }
    assert_eq!(test.chain.get_block_by_number(6).unwrap(), None);
    assert_eq!(
        test.chain.get_block_by_number(0).unwrap().map(|b| b.hash()),
        Some(genesis().hash())
    );
}

#[test]
fn test_transactions_update_state_and_receipts() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let block = mined_block_with(
        &test.chain,
        &parent,
        1,
        vec![tx("color=blue", 0), tx("no-separator", 1)],
    );
    assert_eq!(test.chain.try_to_connect(&block), ImportResult::ImportedBest);

    assert_eq!(
        test.chain.state_value(b"color").unwrap(),
        Some(b"blue".to_vec())
    );
    let receipts = test.chain.get_receipts(&block.hash()).unwrap().unwrap();
    assert_eq!(receipts.len(), 2);
    assert!(receipts[0].success);
    assert!(!receipts[1].success);
    assert_eq!(
        block.header.energy_used,
        receipts.iter().map(|r| r.energy_used).sum::<u64>()
    );
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_duplicate_import_returns_exist() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let block = mined_block(&test.chain, &parent, 1);

    assert_eq!(test.chain.try_to_connect(&block), ImportResult::ImportedBest);
    let before = snapshot(&test);
    assert_eq!(test.chain.try_to_connect(&block), ImportResult::Exist);
    assert_eq!(snapshot(&test), before);
    assert_eq!(test.chain.metrics().import_count(ImportResult::Exist), 1);
}

#[test]
fn test_genesis_is_already_known() {
    let test = open_chain(ChainConfig::default());
    assert_eq!(
        test.chain.try_to_connect(&genesis().block),
        ImportResult::Exist
    );
}

// ============================================================================
// Rejections
// ============================================================================

#[test]
fn test_unknown_parent_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.parent_hash = [0xEE; 32];
    assert_rejected(&test, &block);
}

#[test]
fn test_wrong_difficulty_is_invalid() {
    let test = open_chain(ChainConfig::default());
    extend(&test.chain, 3, 1);
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.difficulty += 1;
    assert_rejected(&test, &block);
}

#[test]
fn test_wrong_state_root_is_invalid() {
    let test = open_chain(ChainConfig::default());
    extend(&test.chain, 2, 1);
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.state_root = [0x11; 32];
    assert_rejected(&test, &block);
}

#[test]
fn test_wrong_receipts_root_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block_with(&test.chain, &parent, 1, vec![tx("k=v", 0)]);
    block.header.receipts_root = [0x22; 32];
    assert_rejected(&test, &block);
}

#[test]
fn test_wrong_energy_used_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block_with(&test.chain, &parent, 1, vec![tx("k=v", 0)]);
    block.header.energy_used -= 1;
    assert_rejected(&test, &block);
}

#[test]
fn test_executor_failure_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.transactions = vec![tx("k=v", 0), tx("fail now", 1)];
    block.header.tx_root = transactions_root(&block.transactions);
    assert_rejected(&test, &block);
}

#[test]
fn test_transactions_not_matching_root_are_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block_with(&test.chain, &parent, 1, vec![tx("a=1", 0)]);
    block.transactions.push(tx("b=2", 1));
    assert_rejected(&test, &block);
}

#[test]
fn test_timestamp_must_follow_parent() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.timestamp = parent.header.timestamp;
    assert_rejected(&test, &block);
}

#[test]
fn test_future_timestamp_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let block = test
        .chain
        .create_new_block(&parent, Vec::new(), mining_seal(1), u64::MAX / 2, coinbase(1))
        .unwrap();
    assert_rejected(&test, &block);
}

#[test]
fn test_extra_data_limit() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.extra_data = vec![0u8; 33];
    assert_rejected(&test, &block);

    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.extra_data = vec![0u8; 32];
    assert_eq!(test.chain.try_to_connect(&block), ImportResult::ImportedBest);
}

#[test]
fn test_wrong_number_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.number = 5;
    assert_rejected(&test, &block);
}

#[test]
fn test_staking_before_fork_is_invalid() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    assert!(test
        .chain
        .create_new_block(&parent, Vec::new(), staking_seal(2), parent.header.timestamp + 10, coinbase(2))
        .is_err());

    let mut block = mined_block(&test.chain, &parent, 2);
    block.header.seal = staking_seal(2);
    assert_rejected(&test, &block);
}

#[test]
fn test_rejections_are_counted() {
    let test = open_chain(ChainConfig::default());
    let parent = test.chain.best_block();
    let mut block = mined_block(&test.chain, &parent, 1);
    block.header.difficulty = 1;
    assert_rejected(&test, &block);
    assert_eq!(
        test.chain.metrics().import_count(ImportResult::InvalidBlock),
        1
    );
}

// ============================================================================
// Side Branches and Reorganisation
// ============================================================================

#[test]
fn test_equal_weight_sibling_is_not_best() {
    let test = open_chain(ChainConfig::default());
    let genesis_block = test.chain.best_block();
    let first = mined_block(&test.chain, &genesis_block, 1);
    let sibling = mined_block(&test.chain, &genesis_block, 2);

    assert_eq!(test.chain.try_to_connect(&first), ImportResult::ImportedBest);
    assert_eq!(
        test.chain.try_to_connect(&sibling),
        ImportResult::ImportedNotBest
    );

    assert_eq!(test.chain.best_block_hash(), first.hash());
    assert_eq!(test.chain.state_root(), first.header.state_root);
    assert!(!test.chain.is_main_chain(&sibling.hash()).unwrap());
    assert_eq!(
        test.chain.total_difficulty_of(&sibling.hash()).unwrap(),
        test.chain.total_difficulty_of(&first.hash()).unwrap()
    );
    assert!(test.chain.get_receipts(&sibling.hash()).unwrap().is_some());
    assert_eq!(balance(&test.chain, 2), 0);
}

/// Canonical chain genesis..A3 in `test`, plus a heavier branch A1..B4 built
/// on a second chain
fn fork_fixture(config: ChainConfig) -> (TestChain, Vec<Block>, Vec<Block>) {
    let test = open_chain(config.clone());
    let main = extend(&test.chain, 3, 1);

    let builder = open_chain(config);
    assert_eq!(
        builder.chain.try_to_connect(&main[0]),
        ImportResult::ImportedBest
    );
    let side = build_branch(&builder.chain, &main[0], 3, 2);
    (test, main, side)
}

#[test]
fn test_heavier_branch_triggers_reorg() {
    let (test, main, side) = fork_fixture(ChainConfig::default());

    assert_eq!(test.chain.try_to_connect(&side[0]), ImportResult::ImportedNotBest);
    assert_eq!(test.chain.try_to_connect(&side[1]), ImportResult::ImportedNotBest);
    assert_eq!(test.chain.best_block_hash(), main[2].hash());

    assert_eq!(test.chain.try_to_connect(&side[2]), ImportResult::ImportedBest);
    assert_eq!(test.chain.best_block_hash(), side[2].hash());
    assert_eq!(test.chain.size(), 5);
    assert_eq!(test.chain.state_root(), side[2].header.state_root);

    // Main-chain flags follow the new head
    assert!(test.chain.is_main_chain(&main[0].hash()).unwrap());
    assert!(!test.chain.is_main_chain(&main[1].hash()).unwrap());
    assert!(!test.chain.is_main_chain(&main[2].hash()).unwrap());
    for block in &side {
        assert!(test.chain.is_main_chain(&block.hash()).unwrap());
    }
    assert_eq!(test.chain.get_block_by_number(2).unwrap(), Some(side[0].clone()));

    // The replayed state reflects the new branch only
    assert_eq!(balance(&test.chain, 1), BLOCK_REWARD);
    assert_eq!(balance(&test.chain, 2), 3 * BLOCK_REWARD);
    assert_eq!(test.chain.metrics().reorgs.get(), 1);
}

#[test]
fn test_reorg_back_to_original_branch() {
    let (test, main, side) = fork_fixture(ChainConfig::default());
    for block in &side {
        test.chain.try_to_connect(block);
    }
    assert_eq!(test.chain.best_block_hash(), side[2].hash());

    // Two more blocks on the abandoned branch make it heavier again
    let builder = open_chain(ChainConfig::default());
    for block in &main {
        builder.chain.try_to_connect(block);
    }
    let more = build_branch(&builder.chain, &main[2], 2, 1);

    assert_eq!(test.chain.try_to_connect(&more[0]), ImportResult::ImportedNotBest);
    assert_eq!(test.chain.try_to_connect(&more[1]), ImportResult::ImportedBest);
    assert_eq!(test.chain.best_block_hash(), more[1].hash());
    assert!(test.chain.is_main_chain(&main[2].hash()).unwrap());
    assert!(!test.chain.is_main_chain(&side[0].hash()).unwrap());
    assert_eq!(balance(&test.chain, 1), 5 * BLOCK_REWARD);
    assert_eq!(balance(&test.chain, 2), 0);
}

#[test]
fn test_invalid_tip_of_heavier_branch_changes_nothing() {
    let (test, main, side) = fork_fixture(ChainConfig::default());
    test.chain.try_to_connect(&side[0]);
    test.chain.try_to_connect(&side[1]);

    let mut bad_tip = side[2].clone();
    bad_tip.header.state_root = [0x33; 32];
    assert_rejected(&test, &bad_tip);

    assert_eq!(test.chain.best_block_hash(), main[2].hash());
    assert_eq!(test.chain.state_root(), main[2].header.state_root);
    assert!(!test.chain.is_main_chain(&side[1].hash()).unwrap());
    assert!(test.chain.is_main_chain(&main[2].hash()).unwrap());

    // The genuine tip still wins afterwards
    assert_eq!(test.chain.try_to_connect(&side[2]), ImportResult::ImportedBest);
}

#[test]
fn test_fork_beyond_reorg_limit_is_invalid() {
    let config = ChainConfig {
        max_reorg_depth: 1,
        ..ChainConfig::default()
    };
    let (test, main, side) = fork_fixture(config);
    assert_rejected(&test, &side[0]);
    assert_eq!(test.chain.best_block_hash(), main[2].hash());
}

// ============================================================================
// Block Templates
// ============================================================================

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[test]
fn test_template_on_best_imports_as_best() {
    let test = open_chain(ChainConfig::default());
    for i in 1..=5u64 {
        let block = test
            .chain
            .create_block_on_best(Vec::new(), mining_seal(1), coinbase(1))
            .unwrap();
        assert_eq!(block.number(), i);
        assert!(block.header.timestamp <= unix_now() + 15);
        assert_eq!(test.chain.try_to_connect(&block), ImportResult::ImportedBest);
    }
    assert_eq!(
        test.chain.metrics().import_count(ImportResult::InvalidBlock),
        0
    );
}

#[test]
fn test_template_on_best_refuses_head_ahead_of_clock() {
    let lenient = ChainConfig {
        max_future_block_secs: 3600,
        ..ChainConfig::default()
    };
    let test = open_chain(lenient);
    let parent = test.chain.best_block();
    let ahead = test
        .chain
        .create_new_block(&parent, Vec::new(), mining_seal(1), unix_now() + 1000, coinbase(1))
        .unwrap();
    assert_eq!(test.chain.try_to_connect(&ahead), ImportResult::ImportedBest);

    let strict = reopen(&test.store, ChainConfig::default()).unwrap();
    assert_eq!(strict.best_block_hash(), ahead.hash());
    let result = strict.create_block_on_best(Vec::new(), mining_seal(1), coinbase(1));
    match result {
        Err(ChainError::FutureTimestamp { timestamp, limit }) => {
            assert_eq!(timestamp, ahead.header.timestamp + 1);
            assert!(timestamp > limit);
        }
        other => panic!("expected a future timestamp error, got {:?}", other.map(|b| b.hash())),
    }
    assert_eq!(strict.best_block_hash(), ahead.hash());
}

#[test]
fn test_template_on_side_branch_parent_fails() {
    let test = open_chain(ChainConfig::default());
    let genesis_block = test.chain.best_block();
    let first = mined_block(&test.chain, &genesis_block, 1);
    let sibling = mined_block(&test.chain, &genesis_block, 2);
    assert_eq!(test.chain.try_to_connect(&first), ImportResult::ImportedBest);
    assert_eq!(
        test.chain.try_to_connect(&sibling),
        ImportResult::ImportedNotBest
    );

    let before = snapshot(&test);
    let result = test.chain.create_new_block(
        &sibling,
        Vec::new(),
        mining_seal(2),
        sibling.header.timestamp + BLOCK_INTERVAL,
        coinbase(2),
    );
    assert!(matches!(result, Err(ChainError::StateUnavailable(_))));
    assert_eq!(snapshot(&test), before);

    // Canonical parents still build
    let child = mined_block(&test.chain, &first, 1);
    assert_eq!(test.chain.try_to_connect(&child), ImportResult::ImportedBest);
}
