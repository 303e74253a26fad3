//! Versioned authenticated key-value store.
//!
//! The single shared mutable resource of the application thread. All state
//! mutations flow through one [`Tree`]; each consensus block commits a new
//! version with a root hash over the full key space, and a bounded history of
//! committed snapshots serves read-only queries at past heights.
//!
//! This is the reference in-memory implementation; a production deployment
//! substitutes a persistent Merkle tree with the same interface.

use std::collections::BTreeMap;

use crate::crypto::Hash;
use crate::errors::{ChainError, ChainResult};

const EMPTY_ROOT_DOMAIN: &[u8] = b"tessera-empty";

/// Read access shared by the live tree and committed snapshots.
pub trait KeyValueRead {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Key-ordered iteration starting at `start` (inclusive).
    fn iterate_from(&self, start: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    fn iterate_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.iterate_from(prefix)
            .into_iter()
            .take_while(|(key, _)| key.starts_with(prefix))
            .collect()
    }
}

/// An immutable committed version of the tree.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: u64,
    pub root: Hash,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KeyValueRead for Snapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn iterate_from(&self, start: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .range(start.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub struct Tree {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
    history: BTreeMap<u64, Snapshot>,
    checkpoints: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
    max_history: usize,
}

impl Tree {
    pub fn new(max_history: usize) -> Self {
        Self {
            data: BTreeMap::new(),
            version: 0,
            history: BTreeMap::new(),
            checkpoints: Vec::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        self.data.insert(key.to_vec(), value);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.remove(key)
    }

    /// Opens a rollback point. Checkpoints nest; a failing transaction rolls
    /// back exactly the mutations made since its own checkpoint.
    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.data.clone());
    }

    pub fn commit_checkpoint(&mut self) -> ChainResult<()> {
        self.checkpoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| ChainError::Fatal("mkvs: commit without open checkpoint".into()))
    }

    pub fn rollback_checkpoint(&mut self) -> ChainResult<()> {
        let saved = self
            .checkpoints
            .pop()
            .ok_or_else(|| ChainError::Fatal("mkvs: rollback without open checkpoint".into()))?;
        self.data = saved;
        Ok(())
    }

    /// Seals the current contents as `version`, returning its root hash.
    pub fn commit_version(&mut self, version: u64) -> ChainResult<Hash> {
        if !self.checkpoints.is_empty() {
            return Err(ChainError::Fatal(
                "mkvs: commit with open checkpoints".into(),
            ));
        }
        if version <= self.version && !self.history.is_empty() {
            return Err(ChainError::Fatal(format!(
                "mkvs: non-monotone version {version} after {}",
                self.version
            )));
        }
        let root = self.root_hash();
        self.version = version;
        self.history.insert(
            version,
            Snapshot {
                version,
                root,
                data: self.data.clone(),
            },
        );
        while self.history.len() > self.max_history {
            let oldest = *self.history.keys().next().expect("non-empty history");
            self.history.remove(&oldest);
        }
        Ok(root)
    }

    /// Root hash over the current (possibly uncommitted) contents: a binary
    /// Merkle fold over length-prefixed key/value leaves in key order.
    pub fn root_hash(&self) -> Hash {
        let mut leaves: Vec<Hash> = self
            .data
            .iter()
            .map(|(key, value)| {
                Hash::digest_parts(&[
                    &(key.len() as u64).to_be_bytes(),
                    key,
                    &(value.len() as u64).to_be_bytes(),
                    value,
                ])
            })
            .collect();
        merkle_fold(&mut leaves)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self, version: u64) -> Option<&Snapshot> {
        self.history.get(&version)
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.history.values().next_back()
    }
}

impl KeyValueRead for Tree {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn iterate_from(&self, start: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .range(start.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn merkle_fold(leaves: &mut Vec<Hash>) -> Hash {
    if leaves.is_empty() {
        return Hash::digest(EMPTY_ROOT_DOMAIN);
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            next.push(Hash::digest_parts(&[&left.0, &right.0]));
        }
        *leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_prior_contents() {
        let mut tree = Tree::new(4);
        tree.insert(b"a", vec![1]);
        tree.checkpoint();
        tree.insert(b"b", vec![2]);
        tree.remove(b"a");
        tree.rollback_checkpoint().unwrap();
        assert_eq!(tree.get(b"a"), Some(vec![1]));
        assert_eq!(tree.get(b"b"), None);
    }

    #[test]
    fn commit_produces_deterministic_roots() {
        let build = || {
            let mut tree = Tree::new(4);
            tree.insert(b"x/1", vec![1]);
            tree.insert(b"x/2", vec![2, 3]);
            tree.commit_version(1).unwrap()
        };
        assert_eq!(build(), build());

        let mut other = Tree::new(4);
        other.insert(b"x/1", vec![1]);
        assert_ne!(other.commit_version(1).unwrap(), build());
    }

    #[test]
    fn history_serves_past_versions_and_prunes() {
        let mut tree = Tree::new(2);
        tree.insert(b"k", vec![1]);
        let root1 = tree.commit_version(1).unwrap();
        tree.insert(b"k", vec![2]);
        let root2 = tree.commit_version(2).unwrap();
        tree.insert(b"k", vec![3]);
        tree.commit_version(3).unwrap();

        assert_ne!(root1, root2);
        // Version 1 fell out of the bounded history.
        assert!(tree.snapshot(1).is_none());
        let snap = tree.snapshot(2).unwrap();
        assert_eq!(snap.get(b"k"), Some(vec![2]));
        assert_eq!(snap.root, root2);
    }

    #[test]
    fn prefix_iteration_is_ordered() {
        let mut tree = Tree::new(1);
        tree.insert(b"p/b", vec![2]);
        tree.insert(b"p/a", vec![1]);
        tree.insert(b"q/x", vec![9]);
        let pairs = tree.iterate_prefix(b"p/");
        assert_eq!(
            pairs,
            vec![
                (b"p/a".to_vec(), vec![1]),
                (b"p/b".to_vec(), vec![2]),
            ]
        );
    }
}
