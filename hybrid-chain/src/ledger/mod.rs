// Copyright (c) 2024 Botho Foundation

//! Persistent chain data: block bodies and receipts ([`BlockStore`]) and the
//! height-keyed fork-choice index ([`BlockIndex`]).

mod index;
mod store;

pub use index::{level_key, BlockIndex, BlockRecord, IndexError, IndexUpdate, IntegrityStatus};
pub use store::BlockStore;

use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Block not found: {}", hex::encode(.0))]
    BlockNotFound([u8; 32]),

    #[error("Corrupted {0}")]
    Corrupted(String),
}
