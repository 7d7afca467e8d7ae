// Copyright (c) 2024 Botho Foundation

//! Difficulty rules and cumulative-difficulty accounting.
//!
//! Before the fork every block is mined and difficulty retargets from the
//! parent/grandparent timestamp delta in bounded steps. After the fork each
//! block is either mined or staked; a block retargets from the two most recent
//! blocks of its own kind (its seal parent and seal grandparent), each kind with
//! its own target time.
//!
//! Fork choice uses the cumulative difficulty:
//!
//! ```text
//! pre-fork:   total = sum(mining difficulties)
//! post-fork:  total = mining_accumulator * staking_accumulator
//! ```
//!
//! The product means a branch has to be strong on both tracks to win.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{BlockHeader, SealKind};
use crate::config::{ChainConfig, DifficultyConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DifficultyError {
    #[error("staking block at height {0} precedes the hybrid fork")]
    StakingBeforeFork(u64),

    #[error("no {0} ancestor available to retarget from")]
    MissingSealParent(SealKind),
}

/// Accumulated difficulty along one block's ancestry, that block included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyTotals {
    /// Sum of mining difficulties (seeded at the fork if it was empty)
    pub mining: u128,
    /// Sum of staking difficulties (zero before the fork)
    pub staking: u128,
    /// Fork-choice weight
    pub total: U256,
}

/// The two most recent same-kind ancestors of a block being validated or built.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealAncestors<'a> {
    pub parent: Option<&'a BlockHeader>,
    pub grandparent: Option<&'a BlockHeader>,
}

/// Pure difficulty computations, parameterised by chain config.
#[derive(Debug, Clone)]
pub struct DifficultyCalculator {
    config: DifficultyConfig,
    fork_number: Option<u64>,
}

impl DifficultyCalculator {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            config: config.difficulty.clone(),
            fork_number: config.fork_number,
        }
    }

    /// Whether a block at `number` follows the hybrid rules
    pub fn is_fork_active(&self, number: u64) -> bool {
        matches!(self.fork_number, Some(fork) if number >= fork)
    }

    /// Pre-fork retarget from a parent and (optional) grandparent header.
    ///
    /// Each block moves difficulty by at most one step of
    /// `parent / bound_divisor` upward, or `max_downward_adjustment` steps
    /// downward, never below `minimum_difficulty`.
    pub fn next_difficulty(&self, parent: &BlockHeader, grandparent: Option<&BlockHeader>) -> u64 {
        let Some(grandparent) = grandparent else {
            return parent.difficulty.max(self.config.minimum_difficulty);
        };

        let delta = parent.timestamp.saturating_sub(grandparent.timestamp);
        let target = self.config.pre_fork_target_time.max(1);
        let step = (parent.difficulty / self.config.bound_divisor.max(1)).max(1);

        let periods = delta / target;
        let next = match periods {
            0 => parent.difficulty.saturating_add(step),
            1 => parent.difficulty,
            _ => {
                let steps_down = (periods - 1).min(self.config.max_downward_adjustment);
                parent
                    .difficulty
                    .saturating_sub(step.saturating_mul(steps_down))
            }
        };

        next.max(self.config.minimum_difficulty)
    }

    /// Post-fork retarget for a block of `kind` from its same-kind ancestors.
    pub fn next_hybrid_difficulty(&self, kind: SealKind, ancestors: SealAncestors<'_>) -> u64 {
        let next = match (ancestors.parent, ancestors.grandparent) {
            (None, _) => match kind {
                SealKind::Staking => self.config.initial_staking_difficulty,
                SealKind::Mining => self.config.minimum_difficulty,
            },
            (Some(parent), None) => parent.difficulty,
            (Some(parent), Some(grandparent)) => {
                let target = match kind {
                    SealKind::Mining => self.config.mining_target_time,
                    SealKind::Staking => self.config.staking_target_time,
                };
                let delta = parent.timestamp.saturating_sub(grandparent.timestamp);
                let step = (parent.difficulty / self.config.hybrid_rate_divisor.max(1)).max(1);

                if delta < target {
                    parent.difficulty.saturating_add(step)
                } else if delta > target {
                    parent.difficulty.saturating_sub(step)
                } else {
                    parent.difficulty
                }
            }
        };

        next.max(self.config.minimum_difficulty)
    }

    /// Difficulty a block at `number` sealed as `kind` must claim.
    ///
    /// Before the fork all blocks are mined, so the seal ancestors are simply
    /// the parent and grandparent.
    pub fn required_difficulty(
        &self,
        number: u64,
        kind: SealKind,
        ancestors: SealAncestors<'_>,
    ) -> Result<u64, DifficultyError> {
        if self.is_fork_active(number) {
            return Ok(self.next_hybrid_difficulty(kind, ancestors));
        }

        if kind == SealKind::Staking {
            return Err(DifficultyError::StakingBeforeFork(number));
        }
        let parent = ancestors
            .parent
            .ok_or(DifficultyError::MissingSealParent(SealKind::Mining))?;
        Ok(self.next_difficulty(parent, ancestors.grandparent))
    }

    /// Totals for the genesis block, which is always a mined block.
    pub fn genesis_totals(&self, genesis_difficulty: u64) -> DifficultyTotals {
        let mining = genesis_difficulty as u128;
        DifficultyTotals {
            mining,
            staking: 0,
            total: U256::from(mining),
        }
    }

    /// Totals after appending a block of `kind` and `difficulty` at `number`
    /// to an ancestry whose totals are `parent`.
    pub fn accumulate(
        &self,
        parent: &DifficultyTotals,
        number: u64,
        kind: SealKind,
        difficulty: u64,
    ) -> DifficultyTotals {
        let difficulty = difficulty as u128;

        if !self.is_fork_active(number) {
            let mining = parent.mining.saturating_add(difficulty);
            return DifficultyTotals {
                mining,
                staking: parent.staking,
                total: U256::from(mining),
            };
        }

        // First block of each kind after the fork starts from the seed
        let mut mining = if parent.mining == 0 {
            self.config.mining_accumulator_seed as u128
        } else {
            parent.mining
        };
        let mut staking = if parent.staking == 0 {
            self.config.staking_accumulator_seed as u128
        } else {
            parent.staking
        };

        match kind {
            SealKind::Mining => mining = mining.saturating_add(difficulty),
            SealKind::Staking => staking = staking.saturating_add(difficulty),
        }

        DifficultyTotals {
            mining,
            staking,
            total: U256::from(mining) * U256::from(staking),
        }
    }
}
