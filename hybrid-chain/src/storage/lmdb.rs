// Copyright (c) 2024 Botho Foundation

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

/// Default LMDB map size (4GB)
const DEFAULT_MAP_SIZE: usize = 4 * 1024 * 1024 * 1024;

impl From<heed::Error> for StoreError {
    fn from(e: heed::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// LMDB-backed store, one named database per [`Column`].
pub struct LmdbStore {
    env: Env,
    /// Indexed by column position
    databases: Vec<Database<Bytes, Bytes>>,
}

impl LmdbStore {
    /// Open or create a store in the directory `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size(path: &Path, map_size: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(path).map_err(|e| StoreError::Database(e.to_string()))?;

        // SAFETY: the environment is opened once per directory by this process
        // and is never mapped by a second `Env` concurrently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(Column::ALL.len() as u32)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let mut databases = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(column.name()))?;
            databases.push(db);
        }
        wtxn.commit()?;

        info!(path = %path.display(), "Opened LMDB store");

        Ok(Self { env, databases })
    }

    fn db(&self, column: Column) -> Database<Bytes, Bytes> {
        self.databases[column.position()]
    }
}

impl KeyValueStore for LmdbStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let value = self.db(column).get(&rtxn, key)?.map(|bytes| bytes.to_vec());
        Ok(value)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { column, key, value } => {
                    self.db(column).put(&mut wtxn, &key, &value)?;
                }
                WriteOp::Delete { column, key } => {
                    self.db(column).delete(&mut wtxn, &key)?;
                }
            }
        }
        // Dropping the transaction on an early return aborts it
        wtxn.commit()?;
        Ok(())
    }
}
