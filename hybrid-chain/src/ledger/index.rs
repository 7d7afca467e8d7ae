// Copyright (c) 2024 Botho Foundation

//! Height-keyed block index.
//!
//! Every known block (canonical or not) has a [`BlockRecord`] stored in the
//! level for its height. Records carry the cumulative difficulties used for
//! fork choice and the hashes of the latest mining and staking blocks in
//! their ancestry, so seal-parent lookups never walk the chain.
//!
//! Writes made during an import are staged in an [`IndexUpdate`] and land in
//! the same [`WriteBatch`] as the block itself.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::{short_hash, BlockHeader, SealKind};
use crate::difficulty::{DifficultyCalculator, DifficultyTotals};
use crate::storage::{decode, encode, Column, KeyValueStore, StoreError, WriteBatch};

/// Meta key holding one past the highest indexed height
const META_INDEX_SIZE: &[u8] = b"index_size";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Block {} is already indexed", hex::encode(.0))]
    Duplicate([u8; 32]),

    #[error("A genesis record already exists")]
    GenesisExists,

    #[error("Parent {} of block #{number} is not indexed", hex::encode(.parent))]
    ParentNotIndexed { number: u64, parent: [u8; 32] },

    #[error("Block {} is not indexed", hex::encode(.0))]
    UnknownBlock([u8; 32]),
}

/// Outcome of [`BlockIndex::integrity_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Every record agrees with its recomputed totals
    Correct,
    /// Some totals were wrong and have been rewritten
    Fixed,
    /// No record at height 0; nothing was changed
    MissingGenesis,
    /// A level below the index size is absent or a record lost its parent;
    /// nothing was changed
    MissingLevel,
}

impl IntegrityStatus {
    /// Whether the index can be used after the check
    pub fn is_usable(self) -> bool {
        matches!(self, IntegrityStatus::Correct | IntegrityStatus::Fixed)
    }
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityStatus::Correct => write!(f, "CORRECT"),
            IntegrityStatus::Fixed => write!(f, "FIXED"),
            IntegrityStatus::MissingGenesis => write!(f, "MISSING_GENESIS"),
            IntegrityStatus::MissingLevel => write!(f, "MISSING_LEVEL"),
        }
    }
}

/// Index entry for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: [u8; 32],
    pub number: u64,
    pub parent_hash: [u8; 32],
    pub seal: SealKind,
    pub difficulty: u64,
    /// Fork-choice weight of the chain ending here
    pub total_difficulty: U256,
    pub mining_difficulty: u128,
    pub staking_difficulty: u128,
    /// Latest mining block in the ancestry, this block included
    pub latest_mining: Option<[u8; 32]>,
    /// Latest staking block in the ancestry, this block included
    pub latest_staking: Option<[u8; 32]>,
    /// Whether this block is on the canonical chain
    pub main_chain: bool,
}

impl BlockRecord {
    /// Record for the genesis block, which is canonical and mined
    pub fn genesis(header: &BlockHeader, totals: DifficultyTotals) -> Self {
        let hash = header.hash();
        let mut record = Self::from_parts(header, totals, None, None);
        record.latest_mining = Some(hash);
        record.main_chain = true;
        record
    }

    /// Record for a child of `parent`; not canonical until flagged
    pub fn child(header: &BlockHeader, parent: &BlockRecord, totals: DifficultyTotals) -> Self {
        Self::from_parts(header, totals, parent.latest_mining, parent.latest_staking)
    }

    fn from_parts(
        header: &BlockHeader,
        totals: DifficultyTotals,
        latest_mining: Option<[u8; 32]>,
        latest_staking: Option<[u8; 32]>,
    ) -> Self {
        let hash = header.hash();
        let (latest_mining, latest_staking) = match header.seal_kind() {
            SealKind::Mining => (Some(hash), latest_staking),
            SealKind::Staking => (latest_mining, Some(hash)),
        };
        Self {
            hash,
            number: header.number,
            parent_hash: header.parent_hash,
            seal: header.seal_kind(),
            difficulty: header.difficulty,
            total_difficulty: totals.total,
            mining_difficulty: totals.mining,
            staking_difficulty: totals.staking,
            latest_mining,
            latest_staking,
            main_chain: false,
        }
    }

    pub fn totals(&self) -> DifficultyTotals {
        DifficultyTotals {
            mining: self.mining_difficulty,
            staking: self.staking_difficulty,
            total: self.total_difficulty,
        }
    }

    fn set_totals(&mut self, totals: DifficultyTotals) {
        self.total_difficulty = totals.total;
        self.mining_difficulty = totals.mining;
        self.staking_difficulty = totals.staking;
    }

    /// Latest block of `kind` in this record's ancestry, itself included
    pub fn latest_of(&self, kind: SealKind) -> Option<[u8; 32]> {
        match kind {
            SealKind::Mining => self.latest_mining,
            SealKind::Staking => self.latest_staking,
        }
    }
}

/// Store key of the level at `number`
pub fn level_key(number: u64) -> [u8; 8] {
    number.to_be_bytes()
}

/// Persistent block index.
pub struct BlockIndex {
    store: Arc<dyn KeyValueStore>,
}

impl BlockIndex {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Records at `number`, or `None` if the level is absent
    pub fn level(&self, number: u64) -> Result<Option<Vec<BlockRecord>>, IndexError> {
        match self.store.get(Column::Index, &level_key(number))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records at `number` (empty if none)
    pub fn records_at(&self, number: u64) -> Result<Vec<BlockRecord>, IndexError> {
        Ok(self.level(number)?.unwrap_or_default())
    }

    /// Height of an indexed block
    pub fn number_of(&self, hash: &[u8; 32]) -> Result<Option<u64>, IndexError> {
        match self.store.get(Column::Numbers, hash)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Serialization(format!("bad height entry for {}", short_hash(hash)))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &[u8; 32]) -> Result<bool, IndexError> {
        Ok(self.store.contains(Column::Numbers, hash)?)
    }

    pub fn record(&self, hash: &[u8; 32]) -> Result<Option<BlockRecord>, IndexError> {
        let Some(number) = self.number_of(hash)? else {
            return Ok(None);
        };
        Ok(self
            .records_at(number)?
            .into_iter()
            .find(|record| record.hash == *hash))
    }

    /// One past the highest indexed height
    pub fn size(&self) -> Result<u64, IndexError> {
        match self.store.get(Column::Meta, META_INDEX_SIZE)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(0),
        }
    }

    /// The canonical record at `number`
    pub fn main_chain_record_at(&self, number: u64) -> Result<Option<BlockRecord>, IndexError> {
        Ok(self
            .records_at(number)?
            .into_iter()
            .find(|record| record.main_chain))
    }

    pub fn total_difficulty(&self, hash: &[u8; 32]) -> Result<Option<U256>, IndexError> {
        Ok(self.record(hash)?.map(|record| record.total_difficulty))
    }

    /// Index a new record and persist it immediately
    pub fn append(&self, record: BlockRecord) -> Result<(), IndexError> {
        let mut update = self.begin_update();
        update.append(record)?;
        self.apply(update)
    }

    /// Set the canonical flag of an indexed block. Idempotent.
    pub fn set_main_chain(&self, hash: &[u8; 32], main_chain: bool) -> Result<(), IndexError> {
        let number = self
            .number_of(hash)?
            .ok_or(IndexError::UnknownBlock(*hash))?;
        let mut update = self.begin_update();
        update.set_main_chain(hash, number, main_chain)?;
        self.apply(update)
    }

    /// Whether a record's totals equal its parent's totals plus its own
    /// difficulty
    pub fn is_consistent(
        &self,
        hash: &[u8; 32],
        calculator: &DifficultyCalculator,
    ) -> Result<bool, IndexError> {
        let record = self.record(hash)?.ok_or(IndexError::UnknownBlock(*hash))?;
        let expected = if record.number == 0 {
            calculator.genesis_totals(record.difficulty)
        } else {
            let parent = self
                .record(&record.parent_hash)?
                .ok_or(IndexError::ParentNotIndexed {
                    number: record.number,
                    parent: record.parent_hash,
                })?;
            calculator.accumulate(&parent.totals(), record.number, record.seal, record.difficulty)
        };
        Ok(record.totals() == expected)
    }

    pub fn begin_update(&self) -> IndexUpdate<'_> {
        IndexUpdate {
            index: self,
            levels: BTreeMap::new(),
            numbers: Vec::new(),
            size: None,
        }
    }

    fn apply(&self, update: IndexUpdate<'_>) -> Result<(), IndexError> {
        let mut batch = WriteBatch::new();
        update.stage(&mut batch)?;
        self.store.write(batch)?;
        Ok(())
    }

    /// Recompute every record's totals from genesis upward.
    ///
    /// Wrong totals are rewritten in one batch and reported as
    /// [`IntegrityStatus::Fixed`]. A missing genesis or a gap below the index
    /// size cannot be repaired here and leaves the store untouched.
    ///
    /// The scan does not stop at the stored size: levels found above it mean
    /// the counter is stale, and it is rewritten with the other repairs.
    pub fn integrity_check(
        &self,
        calculator: &DifficultyCalculator,
    ) -> Result<IntegrityStatus, IndexError> {
        let size = self.size()?;

        let mut previous = match self.level(0)? {
            Some(level) if !level.is_empty() => level,
            _ => {
                warn!("Block index has no genesis record");
                return Ok(IntegrityStatus::MissingGenesis);
            }
        };

        let mut batch = WriteBatch::new();
        let mut repaired = 0usize;

        let mut genesis_changed = false;
        for record in previous.iter_mut() {
            let expected = calculator.genesis_totals(record.difficulty);
            if record.totals() != expected {
                warn!(block = %short_hash(&record.hash), "Repairing genesis totals");
                record.set_totals(expected);
                genesis_changed = true;
                repaired += 1;
            }
        }
        if genesis_changed {
            batch.put(Column::Index, level_key(0), encode(&previous)?);
        }

        let mut number = 1;
        loop {
            let mut level = match self.level(number)? {
                Some(level) if !level.is_empty() => level,
                _ if number < size => {
                    warn!(height = number, size, "Block index level is missing");
                    return Ok(IntegrityStatus::MissingLevel);
                }
                _ => break,
            };

            let mut changed = false;
            for record in level.iter_mut() {
                let Some(parent) = previous.iter().find(|p| p.hash == record.parent_hash) else {
                    warn!(
                        height = number,
                        block = %short_hash(&record.hash),
                        "Parent record is missing"
                    );
                    return Ok(IntegrityStatus::MissingLevel);
                };

                let expected =
                    calculator.accumulate(&parent.totals(), record.number, record.seal, record.difficulty);
                if record.totals() != expected {
                    debug!(
                        height = number,
                        block = %short_hash(&record.hash),
                        stored = %record.total_difficulty,
                        expected = %expected.total,
                        "Repairing cumulative difficulty"
                    );
                    record.set_totals(expected);
                    changed = true;
                    repaired += 1;
                }
            }

            if changed {
                batch.put(Column::Index, level_key(number), encode(&level)?);
            }
            previous = level;
            number += 1;
        }

        if number != size {
            warn!(stored = size, actual = number, "Repairing block index size");
            batch.put(Column::Meta, META_INDEX_SIZE, encode(&number)?);
        }

        if batch.is_empty() {
            return Ok(IntegrityStatus::Correct);
        }

        self.store.write(batch)?;
        info!(records = repaired, "Repaired block index");
        Ok(IntegrityStatus::Fixed)
    }
}

/// Index edits staged for a single atomic write.
pub struct IndexUpdate<'a> {
    index: &'a BlockIndex,
    levels: BTreeMap<u64, Vec<BlockRecord>>,
    numbers: Vec<([u8; 32], u64)>,
    size: Option<u64>,
}

impl IndexUpdate<'_> {
    fn level_mut(&mut self, number: u64) -> Result<&mut Vec<BlockRecord>, IndexError> {
        if !self.levels.contains_key(&number) {
            let level = self.index.records_at(number)?;
            self.levels.insert(number, level);
        }
        Ok(self.levels.entry(number).or_default())
    }

    fn is_indexed(&self, hash: &[u8; 32]) -> Result<bool, IndexError> {
        if self.numbers.iter().any(|(h, _)| h == hash) {
            return Ok(true);
        }
        self.index.contains(hash)
    }

    /// Stage a new record. Its parent must be indexed one level down, and
    /// only one genesis record may exist.
    pub fn append(&mut self, record: BlockRecord) -> Result<(), IndexError> {
        if self.is_indexed(&record.hash)? {
            return Err(IndexError::Duplicate(record.hash));
        }

        let number = record.number;
        if number == 0 {
            if !self.level_mut(0)?.is_empty() {
                return Err(IndexError::GenesisExists);
            }
        } else {
            let parent_hash = record.parent_hash;
            let parent_present = self
                .level_mut(number - 1)?
                .iter()
                .any(|parent| parent.hash == parent_hash);
            if !parent_present {
                return Err(IndexError::ParentNotIndexed {
                    number,
                    parent: parent_hash,
                });
            }
        }

        self.grow_to(number)?;
        self.numbers.push((record.hash, number));
        self.level_mut(number)?.push(record);
        Ok(())
    }

    /// Stage `record` in place of any record with the same hash. The parent
    /// is not checked; used when rebuilding records bottom-up.
    pub fn put_record(&mut self, record: BlockRecord) -> Result<(), IndexError> {
        let number = record.number;
        let hash = record.hash;
        let level = self.level_mut(number)?;
        match level.iter_mut().find(|existing| existing.hash == hash) {
            Some(existing) => *existing = record,
            None => level.push(record),
        }
        self.grow_to(number)?;
        self.numbers.push((hash, number));
        Ok(())
    }

    fn grow_to(&mut self, number: u64) -> Result<(), IndexError> {
        let current_size = match self.size {
            Some(size) => size,
            None => self.index.size()?,
        };
        self.size = Some(current_size.max(number + 1));
        Ok(())
    }

    /// Stage a canonical-flag change for a block known to be at `number`
    pub fn set_main_chain(
        &mut self,
        hash: &[u8; 32],
        number: u64,
        main_chain: bool,
    ) -> Result<(), IndexError> {
        let record = self
            .level_mut(number)?
            .iter_mut()
            .find(|record| record.hash == *hash)
            .ok_or(IndexError::UnknownBlock(*hash))?;
        record.main_chain = main_chain;
        Ok(())
    }

    /// Add the staged edits to `batch`
    pub fn stage(self, batch: &mut WriteBatch) -> Result<(), IndexError> {
        for (number, level) in &self.levels {
            batch.put(Column::Index, level_key(*number), encode(level)?);
        }
        for (hash, number) in &self.numbers {
            batch.put(Column::Numbers, hash.to_vec(), level_key(*number));
        }
        if let Some(size) = self.size {
            batch.put(Column::Meta, META_INDEX_SIZE, encode(&size)?);
        }
        Ok(())
    }
}
