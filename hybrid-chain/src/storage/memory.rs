// Copyright (c) 2024 Botho Foundation

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

/// In-memory store for tests and ephemeral chains.
#[derive(Debug, Default)]
pub struct MemoryStore {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored in `column`
    pub fn len(&self, column: Column) -> usize {
        self.columns
            .read()
            .get(&column)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.read().values().all(|entries| entries.is_empty())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .columns
            .read()
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        // Holding the write lock for the whole batch keeps it atomic for readers
        let mut columns = self.columns.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns.entry(column).or_default().insert(key, value);
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(&column) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
