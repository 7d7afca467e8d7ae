// Copyright (c) 2024 Botho Foundation

//! Two-level content-addressed trie.
//!
//! The root is a branch of 16 children selected by the high nibble of
//! `sha256(key)`; each child is a leaf holding its entries sorted by key.
//! A node is stored under `sha256(encoded node)`, so identical contents share
//! storage and a root hash fixes the whole state. The all-zero hash stands for
//! an empty branch or leaf and is never stored.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use super::StateError;
use crate::block::EMPTY_ROOT;
use crate::storage::{decode, encode};

const BRANCH_WIDTH: usize = 16;

type Children = [[u8; 32]; BRANCH_WIDTH];
type Entries = Vec<(Vec<u8>, Vec<u8>)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum TrieNode {
    Branch { children: Children },
    Leaf { entries: Entries },
}

/// Where encoded nodes are read from.
pub(crate) trait NodeSource {
    fn node(&self, hash: &[u8; 32]) -> Result<Option<Vec<u8>>, StateError>;
}

/// A source with no nodes, for computing roots from scratch.
pub(crate) struct NoNodes;

impl NodeSource for NoNodes {
    fn node(&self, _hash: &[u8; 32]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(None)
    }
}

fn bucket(key: &[u8]) -> usize {
    let digest = Sha256::digest(key);
    (digest[0] >> 4) as usize
}

fn load(source: &dyn NodeSource, hash: &[u8; 32]) -> Result<TrieNode, StateError> {
    let bytes = source
        .node(hash)?
        .ok_or(StateError::MissingNode(*hash))?;
    Ok(decode(&bytes)?)
}

fn load_children(source: &dyn NodeSource, root: &[u8; 32]) -> Result<Children, StateError> {
    if *root == EMPTY_ROOT {
        return Ok([EMPTY_ROOT; BRANCH_WIDTH]);
    }
    match load(source, root)? {
        TrieNode::Branch { children } => Ok(children),
        TrieNode::Leaf { .. } => Err(StateError::UnexpectedNode(*root)),
    }
}

fn load_entries(source: &dyn NodeSource, hash: &[u8; 32]) -> Result<Entries, StateError> {
    if *hash == EMPTY_ROOT {
        return Ok(Vec::new());
    }
    match load(source, hash)? {
        TrieNode::Leaf { entries } => Ok(entries),
        TrieNode::Branch { .. } => Err(StateError::UnexpectedNode(*hash)),
    }
}

/// Encode `node` into `sink` and return its hash
fn store(node: &TrieNode, sink: &mut HashMap<[u8; 32], Vec<u8>>) -> Result<[u8; 32], StateError> {
    let bytes = encode(node)?;
    let hash: [u8; 32] = Sha256::digest(&bytes).into();
    sink.insert(hash, bytes);
    Ok(hash)
}

/// Look up `key` under `root`
pub(crate) fn get(
    source: &dyn NodeSource,
    root: &[u8; 32],
    key: &[u8],
) -> Result<Option<Vec<u8>>, StateError> {
    let children = load_children(source, root)?;
    let entries = load_entries(source, &children[bucket(key)])?;
    Ok(entries
        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        .ok()
        .map(|i| entries[i].1.clone()))
}

/// Apply `changes` on top of `root`. New nodes go to `sink`; the result is
/// the new root. `None` values delete.
pub(crate) fn apply(
    source: &dyn NodeSource,
    root: &[u8; 32],
    changes: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    sink: &mut HashMap<[u8; 32], Vec<u8>>,
) -> Result<[u8; 32], StateError> {
    if changes.is_empty() {
        return Ok(*root);
    }

    let mut by_bucket: BTreeMap<usize, Vec<(&Vec<u8>, &Option<Vec<u8>>)>> = BTreeMap::new();
    for (key, value) in changes {
        by_bucket.entry(bucket(key)).or_default().push((key, value));
    }

    let mut children = load_children(source, root)?;
    for (index, edits) in by_bucket {
        let mut entries = load_entries(source, &children[index])?;
        for (key, value) in edits {
            let position = entries.binary_search_by(|(k, _)| k.cmp(key));
            match (position, value) {
                (Ok(i), Some(value)) => entries[i].1 = value.clone(),
                (Err(i), Some(value)) => entries.insert(i, (key.clone(), value.clone())),
                (Ok(i), None) => {
                    entries.remove(i);
                }
                (Err(_), None) => {}
            }
        }
        children[index] = if entries.is_empty() {
            EMPTY_ROOT
        } else {
            store(&TrieNode::Leaf { entries }, sink)?
        };
    }

    if children.iter().all(|child| *child == EMPTY_ROOT) {
        return Ok(EMPTY_ROOT);
    }
    store(&TrieNode::Branch { children }, sink)
}

/// Whether every node reachable from `root` is present and decodes
pub(crate) fn is_complete(source: &dyn NodeSource, root: &[u8; 32]) -> bool {
    let Ok(children) = load_children(source, root) else {
        return false;
    };
    children
        .iter()
        .all(|child| load_entries(source, child).is_ok())
}
