//! Incremental sparse Merkle tree engine.
//!
//! Fixed height 20 (capacity 2^20 leaves per chunk). Only ancestors of real
//! leaves are materialized; every missing sibling is the pre-computed
//! zero-subtree hash for its level, so an empty chunk costs nothing and a
//! chunk with n leaves stores O(n) nodes.
//!
//! Two build modes:
//! - `build` hashes a whole leaf prefix bottom-up.
//! - `update` appends new leaves and rehashes only the touched root paths.
//!   If the caller's prefix disagrees with what is stored, the tree is
//!   rebuilt from scratch instead of silently truncated.
//!
//! Trees are persisted per chunk as `trees/chunk-<id>.json` next to the rest
//! of the agent state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{TREE_CAPACITY, TREE_HEIGHT};
use crate::error::{AgentError, AgentResult};
use crate::poseidon::{fr_from_dec, fr_to_dec, poseidon2};
use crate::utils::{now_ms, write_private_atomic};

static ZEROS: OnceLock<[Fr; TREE_HEIGHT + 1]> = OnceLock::new();

/// `zeros()[l]` is the root of a complete all-zero subtree of height `l`;
/// index 0 is the zero leaf itself. Must match the table baked into the
/// on-chain program.
pub fn zeros() -> &'static [Fr; TREE_HEIGHT + 1] {
    ZEROS.get_or_init(|| {
        let mut z = [Fr::from(0u64); TREE_HEIGHT + 1];
        for l in 1..=TREE_HEIGHT {
            z[l] = poseidon2(z[l - 1], z[l - 1]);
        }
        z
    })
}

/// Inclusion path from a leaf to the root. Owned values; holds no reference
/// into engine storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerklePath {
    pub leaf_index: u32,
    /// One sibling per level, leaf level first.
    pub siblings: Vec<Fr>,
    /// 1 where the current node is a right child at that level.
    pub bits: Vec<u8>,
    pub root: Fr,
}

impl MerklePath {
    /// Fold the path from a leaf value back up to a root (test/verification
    /// helper; the circuit performs the same computation).
    pub fn fold(&self, leaf: Fr) -> Fr {
        let mut acc = leaf;
        for (sibling, bit) in self.siblings.iter().zip(self.bits.iter()) {
            acc = if *bit == 1 {
                poseidon2(*sibling, acc)
            } else {
                poseidon2(acc, *sibling)
            };
        }
        acc
    }
}

/// One chunk's replica: leaf prefix, sparse node map, current root.
#[derive(Debug, Clone)]
pub struct ChunkTree {
    leaves: Vec<Fr>,
    nodes: HashMap<(u8, u32), Fr>,
    root: Fr,
}

impl ChunkTree {
    pub fn empty() -> Self {
        Self {
            leaves: Vec::new(),
            nodes: HashMap::new(),
            root: zeros()[TREE_HEIGHT],
        }
    }

    /// Full build from a leaf prefix.
    pub fn build(leaves: Vec<Fr>) -> AgentResult<Self> {
        if leaves.len() > TREE_CAPACITY {
            return Err(AgentError::Capacity(format!(
                "chunk overflow: {} leaves > {}",
                leaves.len(),
                TREE_CAPACITY
            )));
        }
        let mut nodes = HashMap::new();
        for (i, leaf) in leaves.iter().enumerate() {
            nodes.insert((0u8, i as u32), *leaf);
        }
        let z = zeros();
        let mut width = leaves.len() as u32;
        for level in 1..=TREE_HEIGHT as u8 {
            width = width.div_ceil(2);
            for i in 0..width {
                let left = nodes
                    .get(&(level - 1, 2 * i))
                    .copied()
                    .unwrap_or(z[level as usize - 1]);
                let right = nodes
                    .get(&(level - 1, 2 * i + 1))
                    .copied()
                    .unwrap_or(z[level as usize - 1]);
                nodes.insert((level, i), poseidon2(left, right));
            }
        }
        let root = nodes
            .get(&(TREE_HEIGHT as u8, 0))
            .copied()
            .unwrap_or(z[TREE_HEIGHT]);
        Ok(Self {
            leaves,
            nodes,
            root,
        })
    }

    /// Append-only update to a longer leaf prefix. Rebuilds from scratch if
    /// the stored prefix disagrees with the caller's.
    pub fn update(&mut self, leaves: &[Fr]) -> AgentResult<()> {
        if leaves.len() > TREE_CAPACITY {
            return Err(AgentError::Capacity(format!(
                "chunk overflow: {} leaves > {}",
                leaves.len(),
                TREE_CAPACITY
            )));
        }
        let prefix_ok = leaves.len() >= self.leaves.len()
            && self.leaves.iter().zip(leaves.iter()).all(|(a, b)| a == b);
        if !prefix_ok {
            warn!(
                stored = self.leaves.len(),
                incoming = leaves.len(),
                "leaf prefix mismatch, rebuilding chunk tree"
            );
            *self = Self::build(leaves.to_vec())?;
            return Ok(());
        }
        let z = zeros();
        for idx in self.leaves.len()..leaves.len() {
            let idx = idx as u32;
            self.nodes.insert((0, idx), leaves[idx as usize]);
            self.leaves.push(leaves[idx as usize]);
            let mut i = idx;
            for level in 1..=TREE_HEIGHT as u8 {
                i /= 2;
                let left = self
                    .nodes
                    .get(&(level - 1, 2 * i))
                    .copied()
                    .unwrap_or(z[level as usize - 1]);
                let right = self
                    .nodes
                    .get(&(level - 1, 2 * i + 1))
                    .copied()
                    .unwrap_or(z[level as usize - 1]);
                self.nodes.insert((level, i), poseidon2(left, right));
            }
        }
        self.root = self
            .nodes
            .get(&(TREE_HEIGHT as u8, 0))
            .copied()
            .unwrap_or(z[TREE_HEIGHT]);
        Ok(())
    }

    pub fn path(&self, leaf_index: u32) -> AgentResult<MerklePath> {
        if leaf_index as usize >= self.leaves.len() {
            return Err(AgentError::NotFound(format!(
                "leaf {leaf_index} not in tree ({} leaves)",
                self.leaves.len()
            )));
        }
        let z = zeros();
        let mut siblings = Vec::with_capacity(TREE_HEIGHT);
        let mut bits = Vec::with_capacity(TREE_HEIGHT);
        let mut idx = leaf_index;
        for level in 0..TREE_HEIGHT as u8 {
            let sibling = self
                .nodes
                .get(&(level, idx ^ 1))
                .copied()
                .unwrap_or(z[level as usize]);
            siblings.push(sibling);
            bits.push((idx & 1) as u8);
            idx /= 2;
        }
        Ok(MerklePath {
            leaf_index,
            siblings,
            bits,
            root: self.root,
        })
    }

    pub fn root(&self) -> Fr {
        self.root
    }

    pub fn leaves(&self) -> &[Fr] {
        &self.leaves
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Index of a commitment in the leaf sequence (linear scan).
    pub fn find_leaf(&self, value: Fr) -> Option<u32> {
        self.leaves.iter().position(|l| *l == value).map(|i| i as u32)
    }

    /// Internal nodes serialized level-by-level. With a prefix of n leaves
    /// the materialized nodes at level l are exactly indices
    /// `0..ceil(n / 2^l)`, so this flat form is reconstructible without
    /// rehashing.
    fn internal_nodes(&self) -> Vec<Fr> {
        let z = zeros();
        let mut out = Vec::new();
        let mut width = self.leaves.len() as u32;
        for level in 1..=TREE_HEIGHT as u8 {
            width = width.div_ceil(2);
            for i in 0..width {
                out.push(
                    self.nodes
                        .get(&(level, i))
                        .copied()
                        .unwrap_or(z[level as usize]),
                );
            }
        }
        out
    }

    /// Rebuild a tree from its serialized parts. The node values are trusted
    /// here; callers are expected to check the root against the chain before
    /// installing a tree that came from disk or a peer.
    pub fn from_parts(leaves: Vec<Fr>, internal: &[Fr], root: Fr) -> AgentResult<Self> {
        if leaves.len() > TREE_CAPACITY {
            return Err(AgentError::Capacity("chunk overflow".to_string()));
        }
        let mut expected = 0usize;
        let mut width = leaves.len() as u32;
        for _ in 1..=TREE_HEIGHT {
            width = width.div_ceil(2);
            expected += width as usize;
        }
        if internal.len() != expected {
            return Err(AgentError::Integrity(format!(
                "tree node list has {} entries, expected {expected} for {} leaves",
                internal.len(),
                leaves.len()
            )));
        }
        let mut nodes = HashMap::new();
        for (i, leaf) in leaves.iter().enumerate() {
            nodes.insert((0u8, i as u32), *leaf);
        }
        let mut cursor = 0usize;
        let mut width = leaves.len() as u32;
        for level in 1..=TREE_HEIGHT as u8 {
            width = width.div_ceil(2);
            for i in 0..width {
                nodes.insert((level, i), internal[cursor]);
                cursor += 1;
            }
        }
        let stored_root = nodes
            .get(&(TREE_HEIGHT as u8, 0))
            .copied()
            .unwrap_or(zeros()[TREE_HEIGHT]);
        if stored_root != root {
            return Err(AgentError::Integrity(
                "tree root does not match node map".to_string(),
            ));
        }
        Ok(Self {
            leaves,
            nodes,
            root,
        })
    }
}

/// On-disk / on-wire form of a chunk replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub chunk_id: u32,
    pub leaves: Vec<String>,
    pub tree: Vec<String>,
    pub root: String,
    pub leaf_count: usize,
    #[serde(default)]
    pub timestamp: Option<u128>,
}

impl TreeSnapshot {
    pub fn from_tree(chunk_id: u32, tree: &ChunkTree) -> Self {
        Self {
            chunk_id,
            leaves: tree.leaves.iter().map(|l| fr_to_dec(*l)).collect(),
            tree: tree.internal_nodes().iter().map(|n| fr_to_dec(*n)).collect(),
            root: fr_to_dec(tree.root),
            leaf_count: tree.leaves.len(),
            timestamp: Some(now_ms()),
        }
    }

    pub fn into_tree(self) -> AgentResult<ChunkTree> {
        let leaves = self
            .leaves
            .iter()
            .map(|s| fr_from_dec(s))
            .collect::<AgentResult<Vec<Fr>>>()?;
        if self.leaf_count != leaves.len() {
            return Err(AgentError::Integrity(
                "leafCount disagrees with leaves".to_string(),
            ));
        }
        let internal = self
            .tree
            .iter()
            .map(|s| fr_from_dec(s))
            .collect::<AgentResult<Vec<Fr>>>()?;
        let root = fr_from_dec(&self.root)?;
        ChunkTree::from_parts(leaves, &internal, root)
    }
}

/// Shared engine: all chunk replicas plus the disk cache.
pub struct MerkleEngine {
    trees: Mutex<HashMap<u32, ChunkTree>>,
    cache_dir: PathBuf,
}

impl MerkleEngine {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
            cache_dir: data_dir.join("trees"),
        }
    }

    pub fn chunks(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.trees.lock().expect("tree map lock").keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn leaf_count(&self, chunk_id: u32) -> Option<usize> {
        self.trees
            .lock()
            .expect("tree map lock")
            .get(&chunk_id)
            .map(|t| t.leaf_count())
    }

    pub fn root(&self, chunk_id: u32) -> Option<Fr> {
        self.trees
            .lock()
            .expect("tree map lock")
            .get(&chunk_id)
            .map(|t| t.root())
    }

    /// Install a fully-formed replica (built locally, loaded from cache, or
    /// fetched from a peer).
    pub fn install(&self, chunk_id: u32, tree: ChunkTree) {
        self.trees.lock().expect("tree map lock").insert(chunk_id, tree);
    }

    /// Append-only update; full rebuild on prefix mismatch (§`ChunkTree::update`).
    pub fn update(&self, chunk_id: u32, leaves: &[Fr]) -> AgentResult<()> {
        let mut map = self.trees.lock().expect("tree map lock");
        match map.get_mut(&chunk_id) {
            Some(tree) => tree.update(leaves),
            None => {
                let tree = ChunkTree::build(leaves.to_vec())?;
                map.insert(chunk_id, tree);
                Ok(())
            }
        }
    }

    pub fn path(&self, chunk_id: u32, leaf_index: u32) -> AgentResult<MerklePath> {
        self.trees
            .lock()
            .expect("tree map lock")
            .get(&chunk_id)
            .ok_or_else(|| AgentError::NotFound(format!("no tree for chunk {chunk_id}")))?
            .path(leaf_index)
    }

    pub fn find_leaf(&self, chunk_id: u32, value: Fr) -> Option<u32> {
        self.trees
            .lock()
            .expect("tree map lock")
            .get(&chunk_id)
            .and_then(|t| t.find_leaf(value))
    }

    pub fn snapshot(&self, chunk_id: u32) -> Option<TreeSnapshot> {
        self.trees
            .lock()
            .expect("tree map lock")
            .get(&chunk_id)
            .map(|t| TreeSnapshot::from_tree(chunk_id, t))
    }

    fn cache_path(&self, chunk_id: u32) -> PathBuf {
        self.cache_dir.join(format!("chunk-{chunk_id}.json"))
    }

    /// Write the current replica for a chunk to the disk cache.
    pub fn save_cache(&self, chunk_id: u32) -> AgentResult<()> {
        let snapshot = self
            .snapshot(chunk_id)
            .ok_or_else(|| AgentError::NotFound(format!("no tree for chunk {chunk_id}")))?;
        let bytes = serde_json::to_vec(&snapshot)?;
        write_private_atomic(&self.cache_path(chunk_id), &bytes)?;
        debug!(chunk_id, leaves = snapshot.leaf_count, "tree cache written");
        Ok(())
    }

    /// Synchronous on-demand cache load. Returns None when there is no cache
    /// or it cannot be parsed (a bad cache is discarded, not trusted).
    pub fn load_cache(&self, chunk_id: u32) -> Option<TreeSnapshot> {
        let path = self.cache_path(chunk_id);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<TreeSnapshot>(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(chunk_id, error = %e, "discarding unreadable tree cache");
                None
            }
        }
    }
}
