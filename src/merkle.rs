//! # Merkle Tree
//!
//! Level-by-level hash tree over the full key space, used by anti-entropy
//! to find divergent keys without transferring the whole dataset (spec
//! §4.9). Grounded in the teacher's `store/merkle.rs` bottom-up
//! pairing-with-promotion algorithm, with two changes required for
//! correctness across nodes:
//!
//! 1. Leaves are built from a `BTreeMap` (sorted by key) rather than a
//!    `HashMap`, so two nodes holding the same data always produce the
//!    same tree shape and the same root hash — the teacher's
//!    `HashMap::values()` iteration order is unspecified and would make
//!    root hashes incomparable across processes.
//! 2. Leaf hashes are computed over type-tagged, length-prefixed fields
//!    (key, version, tombstone flag, value) instead of a bare
//!    `"{key}:{value}"` string, so a tombstone and a live value can never
//!    collide and field boundaries can never be confused (e.g. key `"ab"`
//!    value `"c"` vs key `"a"` value `"bc"`).
//!
//! Every level is retained (not just the root), so anti-entropy can walk
//! down from the root comparing one level at a time (spec §9: level-by-
//! level only, no range-digest fast path).

use crate::storage::StorageEntry;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const TAG_LEAF: u8 = 0x01;
const TAG_INTERNAL: u8 = 0x02;

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}

fn leaf_hash(entry: &StorageEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([TAG_LEAF]);
    update_field(&mut hasher, entry.key.as_bytes());
    hasher.update(entry.timestamp_ms.to_be_bytes());
    update_field(&mut hasher, entry.node_id.as_bytes());
    hasher.update(entry.seq.to_be_bytes());
    hasher.update([entry.tombstone as u8]);
    match &entry.value {
        Some(v) => {
            hasher.update([1u8]);
            update_field(&mut hasher, v.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.finalize().into()
}

fn parent_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([TAG_INTERNAL]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// A hash tree over the full `(key -> leaf hash)` mapping.
///
/// `upsert` refreshes a single key in O(log N): when the key already has a
/// leaf, only its hash and the path of parent hashes up to the root are
/// recomputed, leaving every other leaf and internal node untouched. A
/// brand new key changes every subsequent leaf's sorted position in this
/// pairing tree (the leaf after it in sort order may now pair with a
/// different sibling), so that case — and `remove`, which always changes
/// the leaf count — still rebuilds the whole tree. This matches the
/// common case on the Applicator's hot path, where a mutation almost
/// always touches a key the tree already has a leaf for.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: BTreeMap<String, [u8; 32]>,
    /// `levels[0]` holds leaf hashes in sorted-key order; each following
    /// level holds that level's parent hashes; `levels.last()` is the
    /// single-element root level. Empty when the tree has no keys.
    levels: Vec<Vec<[u8; 32]>>,
    sorted_keys: Vec<String>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a full snapshot of storage, discarding any prior
    /// state. Used for the periodic full-rebuild anti-entropy trigger and
    /// for initial construction at startup.
    pub fn rebuild_from(entries: &[StorageEntry]) -> Self {
        let mut tree = Self::new();
        for entry in entries {
            tree.leaves.insert(entry.key.clone(), leaf_hash(entry));
        }
        tree.rebuild();
        tree
    }

    /// Insert or update a single key's leaf hash (spec §4.9 `update(key)`).
    ///
    /// If `entry.key` already has a leaf, its sorted position — and so the
    /// whole tree's shape — is unchanged, so only that leaf and its
    /// ancestors are recomputed: O(log N). A key the tree has never seen
    /// shifts every subsequent leaf's pairing, so it takes the full
    /// `rebuild` path instead.
    pub fn upsert(&mut self, entry: &StorageEntry) {
        let new_hash = leaf_hash(entry);
        match self.leaf_index(&entry.key) {
            Some(idx) => {
                self.leaves.insert(entry.key.clone(), new_hash);
                self.refresh_path(idx, new_hash);
            }
            None => {
                self.leaves.insert(entry.key.clone(), new_hash);
                self.rebuild();
            }
        }
    }

    /// Remove a key's leaf entirely (not a tombstone leaf — used when a
    /// key should no longer appear in the tree at all, e.g. after GC).
    /// Removing a leaf always changes the leaf count, so the shape of a
    /// sort-order-indexed pairing tree must be rebuilt from scratch.
    pub fn remove(&mut self, key: &str) {
        self.leaves.remove(key);
        self.rebuild();
    }

    /// The sorted-order leaf index for a key already present in the tree.
    fn leaf_index(&self, key: &str) -> Option<usize> {
        self.sorted_keys.binary_search(&key.to_string()).ok()
    }

    /// Recompute `leaf_idx`'s hash and every ancestor hash up to the root,
    /// leaving the rest of the tree untouched. O(log N) in the leaf count.
    fn refresh_path(&mut self, leaf_idx: usize, leaf_hash_value: [u8; 32]) {
        let mut idx = leaf_idx;
        let mut hash = leaf_hash_value;
        for level in 0..self.levels.len() {
            self.levels[level][idx] = hash;
            if level + 1 == self.levels.len() {
                break;
            }
            let sibling_idx = idx ^ 1;
            let level_len = self.levels[level].len();
            hash = if sibling_idx >= level_len {
                // idx is the last, unpaired node at this level; it
                // promotes to the next level unchanged.
                self.levels[level][idx]
            } else if idx % 2 == 0 {
                parent_hash(&self.levels[level][idx], &self.levels[level][sibling_idx])
            } else {
                parent_hash(&self.levels[level][sibling_idx], &self.levels[level][idx])
            };
            idx /= 2;
        }
    }

    fn rebuild(&mut self) {
        self.sorted_keys = self.leaves.keys().cloned().collect();
        if self.leaves.is_empty() {
            self.levels = Vec::new();
            return;
        }
        let mut level: Vec<[u8; 32]> = self.leaves.values().cloned().collect();
        let mut levels = vec![level.clone()];
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for chunk in level.chunks(2) {
                if chunk.len() == 2 {
                    next.push(parent_hash(&chunk[0], &chunk[1]));
                } else {
                    next.push(chunk[0]);
                }
            }
            levels.push(next.clone());
            level = next;
        }
        self.levels = levels;
    }

    pub fn root_hash(&self) -> Option<[u8; 32]> {
        self.levels.last().and_then(|l| l.first()).copied()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Number of levels in the tree, root inclusive (0 for an empty tree).
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Hashes at `level`, where `level == 0` is the leaf level and
    /// `level == height() - 1` is the single-element root level.
    pub fn hashes_at_level(&self, level: usize) -> Option<&[[u8; 32]]> {
        self.levels.get(level).map(|v| v.as_slice())
    }

    /// The keys spanned by the node at `(level, index)`, in sorted order —
    /// used once anti-entropy has walked down to the leaf level and needs
    /// to know which actual keys a divergent index covers.
    pub fn keys_in_subtree(&self, level: usize, index: usize) -> &[String] {
        let span = 1usize << level;
        let start = (index * span).min(self.sorted_keys.len());
        let end = ((index + 1) * span).min(self.sorted_keys.len());
        &self.sorted_keys[start..end]
    }
}
