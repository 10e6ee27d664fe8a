//! Membership tree (the accumulator behind membership proofs).
//!
//! This module provides a fixed-depth binary Merkle tree using SHA3-256 for
//! hashing. Leaves are addressed by [`MembershipIndex`]: inserting writes a
//! slot, deleting clears it, and nothing ever shifts. Empty slots hold the
//! zero leaf so the tree only stores the non-empty paths.

use log::debug;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::TreeError;
use crate::types::{IdCommitment, MembershipIndex, MerkleNode, HASH_SIZE};
use crate::utils::parse_bytes32;

/// Depth used by the on-chain registry (2^20 members).
pub const DEFAULT_TREE_DEPTH: usize = 20;

const MAX_TREE_DEPTH: usize = 32;
const EMPTY_LEAF: MerkleNode = [0u8; HASH_SIZE];

/// The accumulator capability the group manager drives.
///
/// There is exactly one writer (the sync worker), so implementations need no
/// internal locking.
pub trait MembershipTree: Send {
    /// Writes `commitments` into contiguous slots starting at `start_index`.
    fn insert_members(
        &mut self,
        start_index: MembershipIndex,
        commitments: &[IdCommitment],
    ) -> Result<(), TreeError>;

    /// Clears the given slots.
    fn delete_members(&mut self, indices: &[MembershipIndex]) -> Result<(), TreeError>;

    fn root(&self) -> Result<MerkleNode, TreeError>;

    /// Durably persists the current tree state.
    fn flush(&mut self) -> Result<(), TreeError>;
}

/// A Merkle proof for leaf inclusion.
///
/// `siblings[0]` is the sibling of the leaf, the last entry is the sibling
/// just below the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf: MerkleNode,
    pub root: MerkleNode,
    pub siblings: Vec<MerkleNode>,
    pub index: MembershipIndex,
}

#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    depth: usize,
    leaves: BTreeMap<MembershipIndex, String>,
}

/// Sparse, index-addressed Merkle tree with optional on-disk snapshot.
#[derive(Clone)]
pub struct PersistentMerkleTree {
    depth: usize,
    zeros: Vec<MerkleNode>,
    nodes: HashMap<(usize, u64), MerkleNode>,
    path: Option<PathBuf>,
}

fn hash_pair(left: &MerkleNode, right: &MerkleNode) -> MerkleNode {
    let mut hasher = Sha3_256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

impl PersistentMerkleTree {
    /// Creates an empty tree kept only in memory; `flush` is a no-op.
    pub fn in_memory(depth: usize) -> Result<Self, TreeError> {
        if depth == 0 || depth > MAX_TREE_DEPTH {
            return Err(TreeError::InvalidDepth(depth));
        }

        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(EMPTY_LEAF);
        for level in 0..depth {
            let below = zeros[level];
            zeros.push(hash_pair(&below, &below));
        }

        Ok(Self {
            depth,
            zeros,
            nodes: HashMap::new(),
            path: None,
        })
    }

    /// Opens the tree persisted at `path`, or an empty one if the file does
    /// not exist yet. Later flushes write back to `path`.
    pub fn open(path: impl AsRef<Path>, depth: usize) -> Result<Self, TreeError> {
        let path = path.as_ref();
        let mut tree = Self::in_memory(depth)?;
        tree.path = Some(path.to_path_buf());

        if !path.exists() {
            debug!("no tree snapshot at {}, starting empty", path.display());
            return Ok(tree);
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: TreeSnapshot =
            serde_json::from_str(&content).map_err(|e| TreeError::Corrupt(e.to_string()))?;

        if snapshot.depth != depth {
            return Err(TreeError::Corrupt(format!(
                "snapshot depth {} does not match configured depth {}",
                snapshot.depth, depth
            )));
        }

        for (index, leaf) in &snapshot.leaves {
            let leaf = parse_bytes32(leaf).map_err(|e| TreeError::Corrupt(e.to_string()))?;
            tree.check_index(*index)?;
            tree.set_leaf(*index, leaf);
        }

        debug!(
            "loaded {} members from {}",
            snapshot.leaves.len(),
            path.display()
        );
        Ok(tree)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of slots the tree can address.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// Number of non-empty slots.
    pub fn member_count(&self) -> usize {
        self.nodes.keys().filter(|(level, _)| *level == 0).count()
    }

    /// Current value of a slot (the zero leaf when empty or out of range).
    pub fn leaf(&self, index: MembershipIndex) -> MerkleNode {
        self.node(0, index)
    }

    pub fn current_root(&self) -> MerkleNode {
        self.node(self.depth, 0)
    }

    fn node(&self, level: usize, index: u64) -> MerkleNode {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.zeros[level])
    }

    fn store(&mut self, level: usize, index: u64, value: MerkleNode) {
        if value == self.zeros[level] {
            self.nodes.remove(&(level, index));
        } else {
            self.nodes.insert((level, index), value);
        }
    }

    fn check_index(&self, index: MembershipIndex) -> Result<(), TreeError> {
        if index >= self.capacity() {
            return Err(TreeError::IndexOutOfRange {
                index,
                depth: self.depth,
            });
        }
        Ok(())
    }

    fn set_leaf(&mut self, index: MembershipIndex, leaf: MerkleNode) {
        self.store(0, index, leaf);

        let mut position = index;
        for level in 0..self.depth {
            let (left, right) = if position % 2 == 0 {
                (self.node(level, position), self.node(level, position + 1))
            } else {
                (self.node(level, position - 1), self.node(level, position))
            };
            position /= 2;
            self.store(level + 1, position, hash_pair(&left, &right));
        }
    }

    /// Generate a Merkle proof for the slot at `index`.
    ///
    /// Returns `None` if the index is outside the tree. Empty slots still get
    /// a proof (of the zero leaf).
    pub fn generate_proof(&self, index: MembershipIndex) -> Option<MerkleProof> {
        if index >= self.capacity() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.depth);
        let mut position = index;
        for level in 0..self.depth {
            siblings.push(self.node(level, position ^ 1));
            position /= 2;
        }

        Some(MerkleProof {
            leaf: self.leaf(index),
            root: self.current_root(),
            siblings,
            index,
        })
    }

    /// Verify a Merkle proof against this tree's root.
    pub fn verify_proof(&self, proof: &MerkleProof) -> bool {
        if proof.root != self.current_root() || proof.siblings.len() != self.depth {
            return false;
        }

        let mut current_hash = proof.leaf;
        let mut index = proof.index;

        for sibling in &proof.siblings {
            if index % 2 == 0 {
                current_hash = hash_pair(&current_hash, sibling);
            } else {
                current_hash = hash_pair(sibling, &current_hash);
            }
            index /= 2;
        }

        current_hash == proof.root
    }

    fn snapshot(&self) -> TreeSnapshot {
        let leaves = self
            .nodes
            .iter()
            .filter(|((level, _), _)| *level == 0)
            .map(|((_, index), leaf)| (*index, hex::encode(leaf)))
            .collect();

        TreeSnapshot {
            depth: self.depth,
            leaves,
        }
    }
}

impl MembershipTree for PersistentMerkleTree {
    fn insert_members(
        &mut self,
        start_index: MembershipIndex,
        commitments: &[IdCommitment],
    ) -> Result<(), TreeError> {
        if commitments.is_empty() {
            return Ok(());
        }

        // Bounds are checked up front so a failing batch leaves the tree untouched.
        let last_index = start_index
            .checked_add(commitments.len() as u64 - 1)
            .ok_or(TreeError::IndexOutOfRange {
                index: start_index,
                depth: self.depth,
            })?;
        self.check_index(last_index)?;

        for (offset, commitment) in commitments.iter().enumerate() {
            self.set_leaf(start_index + offset as u64, *commitment);
        }
        Ok(())
    }

    fn delete_members(&mut self, indices: &[MembershipIndex]) -> Result<(), TreeError> {
        for index in indices {
            self.check_index(*index)?;
        }
        for index in indices {
            self.set_leaf(*index, EMPTY_LEAF);
        }
        Ok(())
    }

    fn root(&self) -> Result<MerkleNode, TreeError> {
        Ok(self.current_root())
    }

    fn flush(&mut self) -> Result<(), TreeError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        let content = serde_json::to_string(&self.snapshot())
            .map_err(|e| TreeError::StorageUnavailable(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;

        debug!(
            "flushed {} members to {}",
            self.member_count(),
            path.display()
        );
        Ok(())
    }
}

impl fmt::Debug for PersistentMerkleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentMerkleTree")
            .field("depth", &self.depth)
            .field("members", &self.member_count())
            .field("root", &hex::encode(self.current_root()))
            .field("path", &self.path)
            .finish()
    }
}

impl fmt::Display for MerkleProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MerkleProof:\n  Leaf: {}\n  Root: {}\n  Index: {}\n  Siblings: {}",
            hex::encode(self.leaf),
            hex::encode(self.root),
            self.index,
            self.siblings.len()
        )
    }
}
