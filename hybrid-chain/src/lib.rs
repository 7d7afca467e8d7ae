// Copyright (c) 2024 Botho Foundation

//! Block import and fork-choice engine for a hybrid proof-of-work /
//! proof-of-stake chain.
//!
//! The entry point is [`chain::Blockchain`]: it validates incoming blocks,
//! executes them through a pluggable [`executor::Executor`], keeps every
//! branch in the [`ledger`], and follows the branch with the greatest
//! cumulative difficulty. The world state lives in a content-addressed trie
//! ([`state`]) on top of a column-oriented key-value [`storage`] backend.

#![deny(clippy::print_stdout)]

pub mod block;
pub mod chain;
pub mod config;
pub mod difficulty;
pub mod executor;
pub mod head;
pub mod ledger;
pub mod metrics;
pub mod recovery;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use chain::{Blockchain, ChainError, Genesis, ImportResult};
pub use config::ChainConfig;
