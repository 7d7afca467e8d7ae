// Copyright (c) 2024 Botho Foundation

//! Byte-oriented key-value storage behind the ledger and the state trie.
//!
//! Data is split into [`Column`]s. A [`WriteBatch`] is applied atomically by
//! every backend; callers must not assume atomicity across separate writes.

mod lmdb;
mod memory;

pub use lmdb::LmdbStore;
pub use memory::MemoryStore;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Logical partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// block hash -> Block
    Blocks,
    /// block hash -> Vec<Receipt>
    Receipts,
    /// height (big endian) -> Vec<BlockRecord>
    Index,
    /// block hash -> height (big endian)
    Numbers,
    /// fixed keys -> chain metadata (best block, index size)
    Meta,
    /// node hash -> encoded trie node
    State,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::Blocks,
        Column::Receipts,
        Column::Index,
        Column::Numbers,
        Column::Meta,
        Column::State,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::Blocks => "blocks",
            Column::Receipts => "receipts",
            Column::Index => "index",
            Column::Numbers => "numbers",
            Column::Meta => "meta",
            Column::State => "state",
        }
    }

    fn position(self) -> usize {
        match self {
            Column::Blocks => 0,
            Column::Receipts => 1,
            Column::Index => 2,
            Column::Numbers => 3,
            Column::Meta => 4,
            Column::State => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// Ordered set of writes applied in one go.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage backend shared by the ledger and the state trie.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every operation in `batch` or none of them
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(column, key, value);
        self.write(batch)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(column, key);
        self.write(batch)
    }
}

/// Serialize a stored value
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Deserialize a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
