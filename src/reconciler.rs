//! Applies batches of on-chain membership events to the tree and root history.
//!
//! A batch is split into two block-keyed tables. Removals (reorged
//! registrations) are undone newest block first, each followed by a
//! backfill of the root history; insertions are then replayed oldest block
//! first, each followed by recording the new root. The watermark only moves
//! once both passes succeed.

use ethers::types::Address;
use log::{debug, error, warn};
use std::collections::BTreeMap;

use crate::error::GroupManagerError;
use crate::merkle::MembershipTree;
use crate::metadata::{MetadataStore, RlnMetadata};
use crate::root_tracker::RootTracker;
use crate::types::{IdCommitment, MembershipEvent, MembershipIndex};

/// Events of one block, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockInsertions {
    /// Lowest index seen in the block; commitments are written from here.
    pub start_index: MembershipIndex,
    pub commitments: Vec<IdCommitment>,
}

/// One batch of events grouped by block number.
///
/// Registrations of a block are assumed to form a contiguous index run that
/// starts at the lowest index seen in the block; commitments are written in
/// arrival order from that index. Gaps or out-of-order delivery inside a
/// block are not detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedBlockTable {
    insertions: BTreeMap<u64, BlockInsertions>,
    removals: BTreeMap<u64, Vec<MembershipIndex>>,
    max_inserted_block: Option<u64>,
}

impl OrderedBlockTable {
    pub fn from_events(events: &[MembershipEvent]) -> Self {
        let mut table = Self::default();

        for event in events {
            if event.removed {
                table
                    .removals
                    .entry(event.block_number)
                    .or_default()
                    .push(event.index);
                continue;
            }

            let block = table
                .insertions
                .entry(event.block_number)
                .or_insert_with(|| BlockInsertions {
                    start_index: event.index,
                    commitments: Vec::new(),
                });
            block.start_index = block.start_index.min(event.index);
            block.commitments.push(event.id_commitment);

            table.max_inserted_block = Some(
                table
                    .max_inserted_block
                    .map_or(event.block_number, |max| max.max(event.block_number)),
            );
        }

        table
    }

    /// Insertion groups, oldest block first.
    pub fn insertions(&self) -> impl Iterator<Item = (u64, &BlockInsertions)> {
        self.insertions.iter().map(|(block, group)| (*block, group))
    }

    /// Removal groups, newest block first.
    pub fn removals(&self) -> impl Iterator<Item = (u64, &[MembershipIndex])> {
        self.removals
            .iter()
            .rev()
            .map(|(block, indices)| (*block, indices.as_slice()))
    }

    /// Highest block among non-removed events.
    pub fn max_inserted_block(&self) -> Option<u64> {
        self.max_inserted_block
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.removals.is_empty()
    }
}

/// Summary of one applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub removed: usize,
    pub last_processed_block: u64,
    pub metadata_persisted: bool,
}

/// Owns the in-memory watermark and applies event batches.
#[derive(Debug, Clone)]
pub struct EventReconciler {
    chain_id: u64,
    contract_address: Address,
    last_processed_block: u64,
}

impl EventReconciler {
    pub fn new(chain_id: u64, contract_address: Address, last_processed_block: u64) -> Self {
        Self {
            chain_id,
            contract_address,
            last_processed_block,
        }
    }

    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block
    }

    /// Applies one batch.
    ///
    /// Any tree failure aborts the batch and leaves the watermark untouched,
    /// so the caller can retry the same range. A failure to persist the new
    /// watermark is only logged.
    pub fn apply_events(
        &mut self,
        tree: &mut dyn MembershipTree,
        tracker: &mut dyn RootTracker,
        store: &dyn MetadataStore,
        events: &[MembershipEvent],
    ) -> Result<ReconcileOutcome, GroupManagerError> {
        let table = OrderedBlockTable::from_events(events);
        if table.is_empty() {
            return Ok(ReconcileOutcome {
                inserted: 0,
                removed: 0,
                last_processed_block: self.last_processed_block,
                metadata_persisted: false,
            });
        }

        let removed = remove_members(tree, tracker, &table)?;
        let inserted = insert_members(tree, tracker, &table)?;

        let last_processed_block = table
            .max_inserted_block()
            .map_or(self.last_processed_block, |block| {
                block.max(self.last_processed_block)
            });
        self.last_processed_block = last_processed_block;

        let metadata = RlnMetadata {
            last_processed_block,
            chain_id: self.chain_id,
            contract_address: self.contract_address,
        };
        let metadata_persisted = match store.set_metadata(&metadata) {
            Ok(()) => {
                debug!(
                    "rln metadata persisted (lastProcessedBlock={})",
                    last_processed_block
                );
                true
            }
            Err(e) => {
                warn!("failed to persist rln metadata: {}", e);
                false
            }
        };

        Ok(ReconcileOutcome {
            inserted,
            removed,
            last_processed_block,
            metadata_persisted,
        })
    }
}

fn remove_members(
    tree: &mut dyn MembershipTree,
    tracker: &mut dyn RootTracker,
    table: &OrderedBlockTable,
) -> Result<usize, GroupManagerError> {
    let mut removed = 0;
    for (block_number, indices) in table.removals() {
        tree.delete_members(indices).map_err(|e| {
            error!("deleting members of block {}: {}", block_number, e);
            GroupManagerError::Reconciliation(e)
        })?;
        tracker.backfill(block_number);
        removed += indices.len();
    }
    Ok(removed)
}

fn insert_members(
    tree: &mut dyn MembershipTree,
    tracker: &mut dyn RootTracker,
    table: &OrderedBlockTable,
) -> Result<usize, GroupManagerError> {
    let mut inserted = 0;
    for (block_number, group) in table.insertions() {
        tree.insert_members(group.start_index, &group.commitments)
            .map_err(|e| {
                error!("inserting members into merkle tree: {}", e);
                GroupManagerError::Reconciliation(e)
            })?;
        tracker
            .update_latest_root(&*tree, block_number)
            .map_err(GroupManagerError::Reconciliation)?;
        inserted += group.commitments.len();
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MetadataError, TreeError};
    use crate::merkle::PersistentMerkleTree;
    use crate::metadata::MemoryMetadataStore;
    use crate::root_tracker::MerkleRootTracker;
    use crate::types::MerkleNode;

    const DEPTH: usize = 10;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Update(u64),
        Backfill(u64),
    }

    #[derive(Default)]
    struct RecordingTracker {
        calls: Vec<Call>,
    }

    impl RootTracker for RecordingTracker {
        fn update_latest_root(
            &mut self,
            tree: &dyn MembershipTree,
            block_number: u64,
        ) -> Result<MerkleNode, TreeError> {
            self.calls.push(Call::Update(block_number));
            tree.root()
        }

        fn backfill(&mut self, block_number: u64) {
            self.calls.push(Call::Backfill(block_number));
        }

        fn roots(&self) -> Vec<MerkleNode> {
            Vec::new()
        }
    }

    /// Records insert calls and can be told to fail on the n-th insert.
    #[derive(Default)]
    struct RecordingTree {
        inserts: Vec<(MembershipIndex, Vec<IdCommitment>)>,
        deletes: Vec<Vec<MembershipIndex>>,
        fail_on_insert: Option<usize>,
    }

    impl MembershipTree for RecordingTree {
        fn insert_members(
            &mut self,
            start_index: MembershipIndex,
            commitments: &[IdCommitment],
        ) -> Result<(), TreeError> {
            if self.fail_on_insert == Some(self.inserts.len()) {
                return Err(TreeError::StorageUnavailable("disk gone".to_string()));
            }
            self.inserts.push((start_index, commitments.to_vec()));
            Ok(())
        }

        fn delete_members(&mut self, indices: &[MembershipIndex]) -> Result<(), TreeError> {
            self.deletes.push(indices.to_vec());
            Ok(())
        }

        fn root(&self) -> Result<MerkleNode, TreeError> {
            Ok([self.inserts.len() as u8; 32])
        }

        fn flush(&mut self) -> Result<(), TreeError> {
            Ok(())
        }
    }

    /// Real tree that refuses the n-th insert call once.
    struct FlakyTree {
        inner: PersistentMerkleTree,
        insert_calls: usize,
        fail_on_insert: Option<usize>,
    }

    impl MembershipTree for FlakyTree {
        fn insert_members(
            &mut self,
            start_index: MembershipIndex,
            commitments: &[IdCommitment],
        ) -> Result<(), TreeError> {
            self.insert_calls += 1;
            if self.fail_on_insert == Some(self.insert_calls) {
                self.fail_on_insert = None;
                return Err(TreeError::StorageUnavailable("disk gone".to_string()));
            }
            self.inner.insert_members(start_index, commitments)
        }

        fn delete_members(&mut self, indices: &[MembershipIndex]) -> Result<(), TreeError> {
            self.inner.delete_members(indices)
        }

        fn root(&self) -> Result<MerkleNode, TreeError> {
            self.inner.root()
        }

        fn flush(&mut self) -> Result<(), TreeError> {
            self.inner.flush()
        }
    }

    struct BrokenStore;

    impl MetadataStore for BrokenStore {
        fn get_metadata(&self) -> Result<Option<RlnMetadata>, MetadataError> {
            Ok(None)
        }

        fn set_metadata(&self, _: &RlnMetadata) -> Result<(), MetadataError> {
            Err(MetadataError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    fn reconciler() -> EventReconciler {
        EventReconciler::new(1337, Address::repeat_byte(0x11), 0)
    }

    fn commitment(byte: u8) -> IdCommitment {
        [byte; 32]
    }

    #[test]
    fn test_table_partitions_by_removed_flag() {
        let events = [
            MembershipEvent::registered(0, commitment(1), 10),
            MembershipEvent::registered(1, commitment(2), 10).into_removed(),
            MembershipEvent::registered(2, commitment(3), 12),
        ];
        let table = OrderedBlockTable::from_events(&events);

        let insert_blocks: Vec<u64> = table.insertions().map(|(block, _)| block).collect();
        let removal_blocks: Vec<u64> = table.removals().map(|(block, _)| block).collect();
        assert_eq!(insert_blocks, vec![10, 12]);
        assert_eq!(removal_blocks, vec![10]);
        assert_eq!(table.max_inserted_block(), Some(12));
    }

    #[test]
    fn test_start_index_is_minimum_of_block_in_arrival_order() {
        let events = [
            MembershipEvent::registered(8, commitment(2), 50),
            MembershipEvent::registered(7, commitment(1), 50),
            MembershipEvent::registered(9, commitment(3), 50),
        ];
        let mut tree = RecordingTree::default();
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();

        reconciler()
            .apply_events(&mut tree, &mut tracker, &store, &events)
            .unwrap();

        assert_eq!(
            tree.inserts,
            vec![(7, vec![commitment(2), commitment(1), commitment(3)])]
        );
    }

    #[test]
    fn test_removals_backfill_newest_block_first() {
        let events = [
            MembershipEvent::registered(0, commitment(1), 100).into_removed(),
            MembershipEvent::registered(1, commitment(2), 110).into_removed(),
            MembershipEvent::registered(2, commitment(3), 105).into_removed(),
        ];
        let mut tree = RecordingTree::default();
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();

        reconciler()
            .apply_events(&mut tree, &mut tracker, &store, &events)
            .unwrap();

        assert_eq!(
            tracker.calls,
            vec![Call::Backfill(110), Call::Backfill(105), Call::Backfill(100)]
        );
        assert_eq!(tree.deletes, vec![vec![1], vec![2], vec![0]]);
    }

    #[test]
    fn test_insertions_update_roots_oldest_block_first() {
        let events = [
            MembershipEvent::registered(2, commitment(3), 110),
            MembershipEvent::registered(0, commitment(1), 100),
            MembershipEvent::registered(1, commitment(2), 105),
        ];
        let mut tree = RecordingTree::default();
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();

        reconciler()
            .apply_events(&mut tree, &mut tracker, &store, &events)
            .unwrap();

        assert_eq!(
            tracker.calls,
            vec![Call::Update(100), Call::Update(105), Call::Update(110)]
        );
    }

    #[test]
    fn test_removals_applied_before_insertions() {
        let events = [
            MembershipEvent::registered(0, commitment(1), 200),
            MembershipEvent::registered(5, commitment(9), 150).into_removed(),
        ];
        let mut tree = RecordingTree::default();
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();

        reconciler()
            .apply_events(&mut tree, &mut tracker, &store, &events)
            .unwrap();

        assert_eq!(tracker.calls, vec![Call::Backfill(150), Call::Update(200)]);
    }

    #[test]
    fn test_watermark_is_monotonic_across_batches() {
        let mut reconciler = reconciler();
        let mut tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        let mut tracker = MerkleRootTracker::default();
        let store = MemoryMetadataStore::default();

        let batches = [
            vec![MembershipEvent::registered(0, commitment(1), 10)],
            vec![
                MembershipEvent::registered(1, commitment(2), 20),
                MembershipEvent::registered(2, commitment(3), 15),
            ],
            vec![MembershipEvent::registered(2, commitment(3), 15).into_removed()],
        ];

        let mut seen = Vec::new();
        for batch in &batches {
            let outcome = reconciler
                .apply_events(&mut tree, &mut tracker, &store, batch)
                .unwrap();
            seen.push(outcome.last_processed_block);
        }

        assert_eq!(seen, vec![10, 20, 20]);
        assert_eq!(store.get_metadata().unwrap().unwrap().last_processed_block, 20);
    }

    #[test]
    fn test_failed_insert_does_not_advance_watermark() {
        let mut reconciler = EventReconciler::new(1, Address::zero(), 40);
        let mut tree = RecordingTree {
            fail_on_insert: Some(1),
            ..Default::default()
        };
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();
        let events = [
            MembershipEvent::registered(0, commitment(1), 50),
            MembershipEvent::registered(1, commitment(2), 51),
        ];

        let result = reconciler.apply_events(&mut tree, &mut tracker, &store, &events);

        assert!(matches!(result, Err(GroupManagerError::Reconciliation(_))));
        assert_eq!(reconciler.last_processed_block(), 40);
        assert_eq!(store.get_metadata().unwrap(), None);
        assert_eq!(tracker.calls, vec![Call::Update(50)]);
    }

    #[test]
    fn test_retrying_failed_batch_reaches_same_root() {
        let events = [
            MembershipEvent::registered(0, commitment(1), 50),
            MembershipEvent::registered(1, commitment(2), 51),
        ];
        let store = MemoryMetadataStore::default();

        let mut expected_tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        reconciler()
            .apply_events(
                &mut expected_tree,
                &mut MerkleRootTracker::default(),
                &store,
                &events,
            )
            .unwrap();

        // The first attempt only gets the first block in before the second fails.
        let mut tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        tree.insert_members(0, &[commitment(1)]).unwrap();
        let mut retry = reconciler();
        retry
            .apply_events(&mut tree, &mut MerkleRootTracker::default(), &store, &events)
            .unwrap();

        assert_eq!(tree.current_root(), expected_tree.current_root());
    }

    #[test]
    fn test_retried_batch_keeps_root_history_monotone() {
        let events = [
            MembershipEvent::registered(0, commitment(1), 50),
            MembershipEvent::registered(1, commitment(2), 51),
            MembershipEvent::registered(2, commitment(3), 52),
        ];
        let store = MemoryMetadataStore::default();
        let mut tree = FlakyTree {
            inner: PersistentMerkleTree::in_memory(DEPTH).unwrap(),
            insert_calls: 0,
            fail_on_insert: Some(3),
        };
        let mut tracker = MerkleRootTracker::default();
        let mut reconciler = reconciler();

        let failed = reconciler.apply_events(&mut tree, &mut tracker, &store, &events);
        assert!(matches!(failed, Err(GroupManagerError::Reconciliation(_))));

        reconciler
            .apply_events(&mut tree, &mut tracker, &store, &events)
            .unwrap();

        let blocks: Vec<u64> = tracker
            .valid_entries()
            .iter()
            .map(|entry| entry.block_number)
            .collect();
        assert_eq!(blocks, vec![50, 51, 52]);
        assert_eq!(tracker.latest().unwrap().root, tree.inner.current_root());
        assert_eq!(reconciler.last_processed_block(), 52);
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let mut reconciler = reconciler();
        let mut tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        let mut tracker = MerkleRootTracker::default();
        let events = [MembershipEvent::registered(0, commitment(1), 77)];

        let outcome = reconciler
            .apply_events(&mut tree, &mut tracker, &BrokenStore, &events)
            .unwrap();

        assert!(!outcome.metadata_persisted);
        assert_eq!(outcome.last_processed_block, 77);
        assert_eq!(reconciler.last_processed_block(), 77);
    }

    #[test]
    fn test_replay_after_restart_is_idempotent() {
        let first = [
            MembershipEvent::registered(0, commitment(1), 10),
            MembershipEvent::registered(1, commitment(2), 10),
        ];
        let second = [MembershipEvent::registered(2, commitment(3), 11)];
        let store = MemoryMetadataStore::default();

        let mut tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        let mut reconciler = reconciler();
        let mut tracker = MerkleRootTracker::default();
        reconciler
            .apply_events(&mut tree, &mut tracker, &store, &first)
            .unwrap();
        reconciler
            .apply_events(&mut tree, &mut tracker, &store, &second)
            .unwrap();
        let root = tree.current_root();

        // Restart rewound to block 10: both batches are seen again.
        let mut restarted = EventReconciler::new(1337, Address::repeat_byte(0x11), 10);
        let mut tracker = MerkleRootTracker::default();
        restarted
            .apply_events(&mut tree, &mut tracker, &store, &first)
            .unwrap();
        restarted
            .apply_events(&mut tree, &mut tracker, &store, &second)
            .unwrap();

        assert_eq!(tree.current_root(), root);
        assert_eq!(restarted.last_processed_block(), 11);
    }

    #[test]
    fn test_insert_then_reorg_removal() {
        let mut reconciler = reconciler();
        let mut tree = PersistentMerkleTree::in_memory(DEPTH).unwrap();
        let empty_root = tree.current_root();
        let mut tracker = MerkleRootTracker::default();
        let store = MemoryMetadataStore::default();

        let registration = MembershipEvent::registered(0, [0xAA; 32], 50);
        reconciler
            .apply_events(&mut tree, &mut tracker, &store, &[registration])
            .unwrap();
        let inserted_root = tree.current_root();
        assert_ne!(inserted_root, empty_root);
        assert_eq!(reconciler.last_processed_block(), 50);

        let mut removal = registration.into_removed();
        removal.block_number = 51;
        reconciler
            .apply_events(&mut tree, &mut tracker, &store, &[removal])
            .unwrap();

        assert_eq!(tree.leaf(0), [0u8; 32]);
        assert_eq!(tree.current_root(), empty_root);
        assert_eq!(tracker.roots(), vec![inserted_root]);
        assert_eq!(reconciler.last_processed_block(), 50);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut reconciler = reconciler();
        let mut tree = RecordingTree::default();
        let mut tracker = RecordingTracker::default();
        let store = MemoryMetadataStore::default();

        let outcome = reconciler
            .apply_events(&mut tree, &mut tracker, &store, &[])
            .unwrap();

        assert_eq!(outcome.inserted, 0);
        assert!(!outcome.metadata_persisted);
        assert!(tracker.calls.is_empty());
        assert_eq!(store.get_metadata().unwrap(), None);
    }
}
