use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rln_membership_sync::{
    merkle::{MembershipTree, PersistentMerkleTree, DEFAULT_TREE_DEPTH},
    metadata::MemoryMetadataStore,
    reconciler::EventReconciler,
    root_tracker::MerkleRootTracker,
    types::{IdCommitment, MembershipEvent},
};

fn commitments(count: u64) -> Vec<IdCommitment> {
    (0..count)
        .map(|i| {
            let mut bytes = [0u8; 32];
            bytes[0..8].copy_from_slice(&(i + 1).to_le_bytes());
            bytes
        })
        .collect()
}

fn bench_batch_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_insertion");

    for member_count in [16u64, 64, 256, 1024].iter() {
        let leaves = commitments(*member_count);

        group.bench_with_input(
            BenchmarkId::from_parameter(member_count),
            member_count,
            |b, _| {
                b.iter(|| {
                    let mut tree = PersistentMerkleTree::in_memory(DEFAULT_TREE_DEPTH).unwrap();
                    tree.insert_members(0, black_box(&leaves)).unwrap();
                    black_box(tree.current_root())
                })
            },
        );
    }

    group.finish();
}

fn bench_member_deletion(c: &mut Criterion) {
    let leaves = commitments(256);
    let mut tree = PersistentMerkleTree::in_memory(DEFAULT_TREE_DEPTH).unwrap();
    tree.insert_members(0, &leaves).unwrap();

    c.bench_function("member_deletion", |b| {
        b.iter(|| {
            let mut pruned = tree.clone();
            pruned.delete_members(black_box(&[17, 42, 255])).unwrap();
            black_box(pruned.current_root())
        })
    });
}

fn bench_merkle_proof_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_proof_generation");

    for member_count in [16u64, 256, 1024].iter() {
        let mut tree = PersistentMerkleTree::in_memory(DEFAULT_TREE_DEPTH).unwrap();
        tree.insert_members(0, &commitments(*member_count)).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(member_count),
            member_count,
            |b, _| b.iter(|| black_box(tree.generate_proof(black_box(0)).unwrap())),
        );
    }

    group.finish();
}

fn bench_reconcile_batch(c: &mut Criterion) {
    let events: Vec<MembershipEvent> = commitments(512)
        .into_iter()
        .enumerate()
        .map(|(i, commitment)| MembershipEvent::registered(i as u64, commitment, 100 + i as u64 / 8))
        .collect();

    c.bench_function("reconcile_batch_512", |b| {
        b.iter(|| {
            let mut tree = PersistentMerkleTree::in_memory(DEFAULT_TREE_DEPTH).unwrap();
            let mut tracker = MerkleRootTracker::default();
            let store = MemoryMetadataStore::default();
            let mut reconciler = EventReconciler::new(1337, Default::default(), 0);
            black_box(
                reconciler
                    .apply_events(&mut tree, &mut tracker, &store, black_box(&events))
                    .unwrap(),
            )
        })
    });
}

criterion_group!(
    benches,
    bench_batch_insertion,
    bench_member_deletion,
    bench_merkle_proof_generation,
    bench_reconcile_batch
);
criterion_main!(benches);
