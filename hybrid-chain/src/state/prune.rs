// Copyright (c) 2024 Botho Foundation

//! World-state retention policy.

use serde::{Deserialize, Serialize};

/// Which historical world states are kept on disk.
///
/// ```toml
/// [prune]
/// mode = "spread"
/// k = 128
/// archive_interval = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PruneConfig {
    /// Keep every state
    #[default]
    Full,
    /// Keep the states of the top `k` blocks
    TopK { k: u64 },
    /// Keep the top `k` blocks plus every `archive_interval`-th block
    Spread { k: u64, archive_interval: u64 },
}

impl PruneConfig {
    /// Whether the state at `height` may have been pruned while the chain
    /// head is at `current_height`. Restricted states must not be used as
    /// recovery targets.
    pub fn is_prune_restricted(&self, height: u64, current_height: u64) -> bool {
        match self {
            PruneConfig::Full => false,
            PruneConfig::TopK { k } => height < current_height.saturating_sub(*k),
            PruneConfig::Spread {
                k,
                archive_interval,
            } => {
                let archived = *archive_interval > 0 && height % archive_interval == 0;
                height < current_height.saturating_sub(*k) && !archived
            }
        }
    }
}
