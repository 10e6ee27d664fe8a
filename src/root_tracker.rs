//! History of valid membership tree roots, keyed by chain height.
//!
//! Proof verification accepts any root in a small window of recent roots.
//! Roots that slide out of the window are kept in a bounded buffer so a
//! reorg-driven [`RootTracker::backfill`] can restore the window to what it
//! looked like before the invalidated blocks were applied.

use log::debug;
use std::collections::VecDeque;

use crate::error::TreeError;
use crate::merkle::MembershipTree;
use crate::types::MerkleNode;

/// Number of recent roots accepted for proof verification.
pub const ACCEPTABLE_ROOT_WINDOW_SIZE: usize = 5;

/// Number of evicted roots kept around for backfilling.
pub const HISTORY_BUFFER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootEntry {
    pub block_number: u64,
    pub root: MerkleNode,
}

pub trait RootTracker: Send {
    /// Records the tree's current root as valid from `block_number` on.
    ///
    /// Call once per block that produced insertions. Recording a block at or
    /// before the latest one replaces every entry from that block on.
    fn update_latest_root(
        &mut self,
        tree: &dyn MembershipTree,
        block_number: u64,
    ) -> Result<MerkleNode, TreeError>;

    /// Drops every root recorded at or after `block_number`.
    fn backfill(&mut self, block_number: u64);

    /// Currently acceptable roots, oldest first.
    fn roots(&self) -> Vec<MerkleNode>;
}

#[derive(Debug, Clone)]
pub struct MerkleRootTracker {
    window_size: usize,
    buffer_size: usize,
    valid_roots: VecDeque<RootEntry>,
    buffer: VecDeque<RootEntry>,
}

impl Default for MerkleRootTracker {
    fn default() -> Self {
        Self::new(ACCEPTABLE_ROOT_WINDOW_SIZE, HISTORY_BUFFER_SIZE)
    }
}

impl MerkleRootTracker {
    pub fn new(window_size: usize, buffer_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            buffer_size,
            valid_roots: VecDeque::with_capacity(window_size + 1),
            buffer: VecDeque::with_capacity(buffer_size + 1),
        }
    }

    /// Drops entries at or after `block_number` and refills the window from the buffer.
    fn truncate_from(&mut self, block_number: u64) {
        self.valid_roots
            .retain(|entry| entry.block_number < block_number);
        self.buffer.retain(|entry| entry.block_number < block_number);

        while self.valid_roots.len() < self.window_size {
            match self.buffer.pop_back() {
                Some(entry) => self.valid_roots.push_front(entry),
                None => break,
            }
        }
    }

    fn push(&mut self, entry: RootEntry) {
        // A replayed block supersedes everything recorded from it on.
        self.truncate_from(entry.block_number);

        self.valid_roots.push_back(entry);
        if self.valid_roots.len() > self.window_size {
            if let Some(evicted) = self.valid_roots.pop_front() {
                self.buffer.push_back(evicted);
            }
            if self.buffer.len() > self.buffer_size {
                self.buffer.pop_front();
            }
        }
    }

    pub fn contains_root(&self, root: &MerkleNode) -> bool {
        self.valid_roots.iter().any(|entry| &entry.root == root)
    }

    pub fn latest(&self) -> Option<RootEntry> {
        self.valid_roots.back().copied()
    }

    /// Entries currently in the acceptable window, oldest first.
    pub fn valid_entries(&self) -> Vec<RootEntry> {
        self.valid_roots.iter().copied().collect()
    }

    /// Roots evicted from the window, oldest first.
    pub fn buffer(&self) -> Vec<MerkleNode> {
        self.buffer.iter().map(|entry| entry.root).collect()
    }
}

impl RootTracker for MerkleRootTracker {
    fn update_latest_root(
        &mut self,
        tree: &dyn MembershipTree,
        block_number: u64,
    ) -> Result<MerkleNode, TreeError> {
        let root = tree.root()?;
        self.push(RootEntry { block_number, root });
        Ok(root)
    }

    fn backfill(&mut self, block_number: u64) {
        let before = self.valid_roots.len();
        self.truncate_from(block_number);

        debug!(
            "backfilled roots from block {}: {} -> {} valid roots",
            block_number,
            before,
            self.valid_roots.len()
        );
    }

    fn roots(&self) -> Vec<MerkleNode> {
        self.valid_roots.iter().map(|entry| entry.root).collect()
    }
}
