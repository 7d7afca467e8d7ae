// Copyright (c) 2024 Botho Foundation

//! Chain configuration.
//!
//! Loaded from TOML; every field has a default so a partial file is valid:
//!
//! ```toml
//! fork_number = 1000
//! max_reorg_depth = 1024
//!
//! [difficulty]
//! minimum_difficulty = 16
//!
//! [prune]
//! mode = "top_k"
//! k = 256
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::state::PruneConfig;

/// Main configuration for the import engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Height at which the hybrid PoW/PoS rules activate (None = never)
    #[serde(default)]
    pub fork_number: Option<u64>,

    /// Deepest fork the importer will roll back and replay
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,

    /// How far ahead of the local clock a block timestamp may be
    #[serde(default = "default_max_future_block_secs")]
    pub max_future_block_secs: u64,

    /// Run the block index integrity check when opening the chain
    #[serde(default)]
    pub check_index_on_startup: bool,

    /// Difficulty rule constants
    #[serde(default)]
    pub difficulty: DifficultyConfig,

    /// State retention policy
    #[serde(default)]
    pub prune: PruneConfig,
}

fn default_max_reorg_depth() -> u64 {
    1024
}

fn default_max_future_block_secs() -> u64 {
    15
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            fork_number: None,
            max_reorg_depth: default_max_reorg_depth(),
            max_future_block_secs: default_max_future_block_secs(),
            check_index_on_startup: false,
            difficulty: DifficultyConfig::default(),
            prune: PruneConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Config with the hybrid rules active from `fork_number`
    pub fn with_fork(fork_number: u64) -> Self {
        Self {
            fork_number: Some(fork_number),
            ..Self::default()
        }
    }

    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }
}

/// Constants for both the pre-fork and the hybrid difficulty rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyConfig {
    /// Floor for any computed difficulty
    #[serde(default = "default_minimum_difficulty")]
    pub minimum_difficulty: u64,

    /// Pre-fork: step size is `parent / bound_divisor`
    #[serde(default = "default_bound_divisor")]
    pub bound_divisor: u64,

    /// Pre-fork: target seconds between blocks
    #[serde(default = "default_pre_fork_target_time")]
    pub pre_fork_target_time: u64,

    /// Pre-fork: largest number of downward steps per block
    #[serde(default = "default_max_downward_adjustment")]
    pub max_downward_adjustment: u64,

    /// Hybrid: target seconds between two mining blocks
    #[serde(default = "default_mining_target_time")]
    pub mining_target_time: u64,

    /// Hybrid: target seconds between two staking blocks
    #[serde(default = "default_staking_target_time")]
    pub staking_target_time: u64,

    /// Hybrid: each retarget moves difficulty by `parent / hybrid_rate_divisor`
    #[serde(default = "default_hybrid_rate_divisor")]
    pub hybrid_rate_divisor: u64,

    /// Difficulty of the first staking block after the fork
    #[serde(default = "default_initial_staking_difficulty")]
    pub initial_staking_difficulty: u64,

    /// Starting value of the staking accumulator at the fork
    #[serde(default = "default_accumulator_seed")]
    pub staking_accumulator_seed: u64,

    /// Starting value of the mining accumulator if none was carried over
    #[serde(default = "default_accumulator_seed")]
    pub mining_accumulator_seed: u64,
}

fn default_minimum_difficulty() -> u64 {
    16
}

fn default_bound_divisor() -> u64 {
    2048
}

fn default_pre_fork_target_time() -> u64 {
    10
}

fn default_max_downward_adjustment() -> u64 {
    99
}

fn default_mining_target_time() -> u64 {
    20
}

fn default_staking_target_time() -> u64 {
    15
}

fn default_hybrid_rate_divisor() -> u64 {
    20
}

fn default_initial_staking_difficulty() -> u64 {
    1_000_000
}

fn default_accumulator_seed() -> u64 {
    1
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            minimum_difficulty: default_minimum_difficulty(),
            bound_divisor: default_bound_divisor(),
            pre_fork_target_time: default_pre_fork_target_time(),
            max_downward_adjustment: default_max_downward_adjustment(),
            mining_target_time: default_mining_target_time(),
            staking_target_time: default_staking_target_time(),
            hybrid_rate_divisor: default_hybrid_rate_divisor(),
            initial_staking_difficulty: default_initial_staking_difficulty(),
            staking_accumulator_seed: default_accumulator_seed(),
            mining_accumulator_seed: default_accumulator_seed(),
        }
    }
}
