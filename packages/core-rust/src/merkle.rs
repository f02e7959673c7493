//! MerkleTree and `ORMapMerkleTree` for efficient delta synchronization.
//!
//! Both trees use a prefix trie structure keyed by hex digits of the FNV-1a hash
//! of entry keys. The trie depth (default 3) determines bucket granularity.
//! Nodes compare root hashes to identify differing subtrees, then walk down
//! to discover the specific keys that need synchronization.

use std::collections::{BTreeMap, BTreeSet};

use crate::hash::{combine_hashes, fnv1a_hash};

/// Default trie depth: divides the 8 hex digits of a 32-bit key hash into a
/// 3-character bucket path, giving 16^3 = 4096 leaf buckets.
pub const DEFAULT_DEPTH: usize = 3;

/// A snapshot of one trie node: its own aggregate hash and the hashes of its
/// immediate children, keyed by branch character.
///
/// Returned by [`MerkleTree::node_at`] to serve `CLUSTER_MERKLE_BUCKETS_REQ`
/// queries without exposing the tree's internal storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleNode {
    /// Aggregate hash of this node's entire subtree.
    pub hash: u32,
    /// Hash of each immediate child, keyed by the next hex digit of the bucket path.
    pub children: BTreeMap<char, u32>,
}

/// Computes the hex bucket path for `key` at `depth` characters.
fn bucket_path(key: &str, depth: usize) -> String {
    let hex = format!("{:08x}", fnv1a_hash(key));
    hex.chars().take(depth).collect()
}

/// A Merkle-style prefix trie over a partition's key space.
///
/// Leaf buckets (at `depth` hex digits) hold the set of present keys together
/// with an opaque content hash per key (typically derived from an
/// [`crate::hlc::Timestamp`] or a serialized record). Internal node hashes are
/// recomputed on demand by folding child hashes with [`combine_hashes`]; the
/// tree does not cache internal hashes, trading a little CPU for a much
/// simpler, always-consistent implementation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    depth: usize,
    /// Leaf bucket path -> (key -> content hash).
    buckets: BTreeMap<String, BTreeMap<String, u32>>,
}

impl MerkleTree {
    /// Creates an empty tree with the given bucket-path depth.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0 or greater than 8 (the hash is only 8 hex digits wide).
    #[must_use]
    pub fn new(depth: usize) -> Self {
        assert!((1..=8).contains(&depth), "merkle depth must be in 1..=8");
        Self {
            depth,
            buckets: BTreeMap::new(),
        }
    }

    /// The configured bucket-path depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the leaf bucket path a key would be stored under.
    #[must_use]
    pub fn path_for_key(&self, key: &str) -> String {
        bucket_path(key, self.depth)
    }

    /// Inserts or updates a key's content hash, creating its bucket if needed.
    pub fn update_record(&mut self, key: &str, content_hash: u32) {
        let path = self.path_for_key(key);
        self.buckets
            .entry(path)
            .or_default()
            .insert(key.to_string(), content_hash);
    }

    /// Removes a key. Drops the bucket entirely once it becomes empty.
    pub fn remove_record(&mut self, key: &str) {
        let path = self.path_for_key(key);
        if let Some(bucket) = self.buckets.get_mut(&path) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&path);
            }
        }
    }

    /// Returns the aggregate hash of every key directly stored in `path`
    /// (a leaf bucket, i.e. `path.len() == self.depth`).
    fn leaf_hash(&self, path: &str) -> u32 {
        match self.buckets.get(path) {
            None => combine_hashes(&[]),
            Some(bucket) => {
                let hashes: Vec<u32> = bucket
                    .iter()
                    .map(|(k, h)| combine_hashes(&[fnv1a_hash(k), *h]))
                    .collect();
                combine_hashes(&hashes)
            }
        }
    }

    /// Returns the aggregate hash of the subtree rooted at `prefix`
    /// (`prefix.len()` may be anywhere from 0 up to `self.depth`).
    #[must_use]
    pub fn subtree_hash(&self, prefix: &str) -> u32 {
        if prefix.len() >= self.depth {
            return self.leaf_hash(prefix);
        }
        let children = self.node_at(prefix);
        let hashes: Vec<u32> = children.children.values().copied().collect();
        combine_hashes(&hashes)
    }

    /// Returns the overall root hash of the tree.
    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.subtree_hash("")
    }

    /// Returns the node at `prefix`: its own aggregate hash plus the hash of
    /// each present immediate child branch. Used to BFS-descend the tree
    /// during repair (`CLUSTER_MERKLE_BUCKETS_REQ`/`RESP`).
    #[must_use]
    pub fn node_at(&self, prefix: &str) -> MerkleNode {
        if prefix.len() >= self.depth {
            return MerkleNode {
                hash: self.leaf_hash(prefix),
                children: BTreeMap::new(),
            };
        }

        let mut children = BTreeMap::new();
        for path in self.buckets.keys() {
            if let Some(rest) = path.strip_prefix(prefix) {
                if let Some(branch) = rest.chars().next() {
                    children.entry(branch).or_insert_with(|| {
                        let mut child_prefix = prefix.to_string();
                        child_prefix.push(branch);
                        self.subtree_hash(&child_prefix)
                    });
                }
            }
        }
        let hash = combine_hashes(&children.values().copied().collect::<Vec<_>>());
        MerkleNode { hash, children }
    }

    /// Returns the set of keys stored in leaf bucket `path`. Empty if absent.
    #[must_use]
    pub fn keys_in_bucket(&self, path: &str) -> BTreeSet<String> {
        self.buckets
            .get(path)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every leaf bucket path currently populated.
    #[must_use]
    pub fn populated_buckets(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    /// Total number of distinct keys across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    /// Whether the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// A `MerkleTree` specialized for OR-Map entries.
///
/// OR-Map merge semantics (tag sets, causal contexts) are out of scope for
/// this crate's anti-entropy layer: the caller supplies an opaque content
/// hash per key (e.g. a hash of the entry's serialized tag set) exactly as it
/// would for [`MerkleTree`]. This wrapper exists as a distinct type so
/// `MapType::Or` buckets are never accidentally compared against
/// `MapType::Lww` buckets during repair.
#[derive(Debug, Clone)]
pub struct ORMapMerkleTree {
    inner: MerkleTree,
}

impl ORMapMerkleTree {
    /// Creates an empty tree with the given bucket-path depth.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            inner: MerkleTree::new(depth),
        }
    }

    /// Inserts or updates a key's content hash.
    pub fn update_record(&mut self, key: &str, content_hash: u32) {
        self.inner.update_record(key, content_hash);
    }

    /// Removes a key.
    pub fn remove_record(&mut self, key: &str) {
        self.inner.remove_record(key);
    }

    /// Returns the overall root hash of the tree.
    #[must_use]
    pub fn root_hash(&self) -> u32 {
        self.inner.root_hash()
    }

    /// Returns the node at `prefix`.
    #[must_use]
    pub fn node_at(&self, prefix: &str) -> MerkleNode {
        self.inner.node_at(prefix)
    }

    /// Returns the set of keys stored in leaf bucket `path`.
    #[must_use]
    pub fn keys_in_bucket(&self, path: &str) -> BTreeSet<String> {
        self.inner.keys_in_bucket(path)
    }

    /// Total number of distinct keys across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
