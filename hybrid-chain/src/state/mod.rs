// Copyright (c) 2024 Botho Foundation

//! World-state access.
//!
//! [`StateAccess`] is the single mutable view of the world state used by the
//! importer. Changes are collected in a [`StateTracker`], folded into the
//! working root by [`StateTracker::flush`], and only reach the store on
//! [`StateAccess::commit`]. [`StateAccess::rollback`] returns to the last
//! committed root.

mod prune;
mod trie;

pub use prune::PruneConfig;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{short_hash, EMPTY_ROOT};
use crate::storage::{Column, KeyValueStore, StoreError, WriteBatch};
use trie::{NoNodes, NodeSource};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("State node {} is missing", hex::encode(.0))]
    MissingNode([u8; 32]),

    #[error("State node {} has the wrong type", hex::encode(.0))]
    UnexpectedNode([u8; 32]),

    #[error("State root {} is not available", hex::encode(.0))]
    InvalidRoot([u8; 32]),
}

/// Mutable view of the world state at some root.
pub struct StateAccess {
    store: Arc<dyn KeyValueStore>,
    /// Working root, including flushed but uncommitted changes
    root: [u8; 32],
    /// Root of the last commit or sync
    committed_root: [u8; 32],
    /// Nodes created since the last commit
    pending: HashMap<[u8; 32], Vec<u8>>,
}

impl NodeSource for StateAccess {
    fn node(&self, hash: &[u8; 32]) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(bytes) = self.pending.get(hash) {
            return Ok(Some(bytes.clone()));
        }
        Ok(self.store.get(Column::State, hash)?)
    }
}

impl StateAccess {
    /// View the state at `root`. The root is not checked; see
    /// [`StateAccess::is_valid_root`].
    pub fn new(store: Arc<dyn KeyValueStore>, root: [u8; 32]) -> Self {
        Self {
            store,
            root,
            committed_root: root,
            pending: HashMap::new(),
        }
    }

    /// Current working root
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    pub fn committed_root(&self) -> [u8; 32] {
        self.committed_root
    }

    pub fn has_pending_changes(&self) -> bool {
        self.root != self.committed_root || !self.pending.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        trie::get(self, &self.root, key)
    }

    /// Begin collecting changes on top of the working root
    pub fn start_tracking(&mut self) -> StateTracker<'_> {
        StateTracker {
            state: self,
            changes: BTreeMap::new(),
        }
    }

    /// Whether the full state under `root` can be read
    pub fn is_valid_root(&self, root: &[u8; 32]) -> bool {
        trie::is_complete(self, root)
    }

    /// Drop uncommitted changes and move to `root`, which must be valid
    pub fn sync_to_root(&mut self, root: &[u8; 32]) -> Result<(), StateError> {
        self.pending.clear();
        if !self.is_valid_root(root) {
            self.root = self.committed_root;
            return Err(StateError::InvalidRoot(*root));
        }
        trace!(root = %short_hash(root), "Synced state");
        self.root = *root;
        self.committed_root = *root;
        Ok(())
    }

    /// Persist nodes created since the last commit and make the working
    /// root the committed one
    pub fn commit(&mut self) -> Result<(), StateError> {
        if !self.pending.is_empty() {
            let mut batch = WriteBatch::new();
            for (hash, bytes) in self.pending.drain() {
                batch.put(Column::State, hash, bytes);
            }
            debug!(nodes = batch.len(), root = %short_hash(&self.root), "Committing state");
            self.store.write(batch)?;
        }
        self.committed_root = self.root;
        Ok(())
    }

    /// Discard everything since the last commit or sync
    pub fn rollback(&mut self) {
        self.pending.clear();
        self.root = self.committed_root;
    }

    /// Discard uncommitted changes and point at `root` without checking it.
    /// Only for roots known to be valid, such as a snapshot taken earlier.
    pub fn reset_to(&mut self, root: [u8; 32]) {
        self.pending.clear();
        self.root = root;
        self.committed_root = root;
    }

    /// Root of a state containing exactly `entries`
    pub fn root_of<I>(entries: I) -> Result<[u8; 32], StateError>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let changes: BTreeMap<_, _> = entries.into_iter().map(|(k, v)| (k, Some(v))).collect();
        let mut sink = HashMap::new();
        trie::apply(&NoNodes, &EMPTY_ROOT, &changes, &mut sink)
    }

    fn apply_changes(
        &mut self,
        changes: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<[u8; 32], StateError> {
        let mut sink = HashMap::new();
        let root = trie::apply(&*self, &self.root, changes, &mut sink)?;
        self.pending.extend(sink);
        self.root = root;
        Ok(root)
    }
}

/// Change set over a [`StateAccess`]. Dropping it without calling
/// [`StateTracker::flush`] discards the changes.
pub struct StateTracker<'a> {
    state: &'a mut StateAccess,
    changes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StateTracker<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match self.changes.get(key) {
            Some(change) => Ok(change.clone()),
            None => self.state.get(key),
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.changes.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.changes.insert(key.into(), None);
    }

    /// Root the state would have if the changes were flushed now
    pub fn root(&self) -> Result<[u8; 32], StateError> {
        let mut scratch = HashMap::new();
        trie::apply(&*self.state, &self.state.root, &self.changes, &mut scratch)
    }

    /// Fold the changes into the working root of the underlying state
    pub fn flush(self) -> Result<[u8; 32], StateError> {
        let StateTracker { state, changes } = self;
        state.apply_changes(&changes)
    }
}
