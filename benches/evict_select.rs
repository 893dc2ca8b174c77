//! Criterion benchmarks for eviction victim selection.
//!
//! - Walking a tree for candidates and draining the queue
//! - Merging candidate batches into the queue

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use archengine::cache::{Candidate, EvictQueue};
use archengine::{Connection, ConnectionConfig, PageRef, RefState, Tree};
use tempfile::TempDir;

/// A connection whose tree holds `rows` rows spread over small resident
/// leaves.
fn resident_tree(rows: u64) -> (Connection, Arc<Tree>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ConnectionConfig::default();
    config.tree.leaf_page_max = 1024;
    config.eviction.queue_slots = 4096;
    config.eviction.threads = 1;
    let conn = Connection::open(dir.path(), config).unwrap();
    let tree = conn.create_tree("bench").unwrap();
    for k in 0..rows {
        tree.put(k, vec![0u8; 100]).unwrap();
    }
    tree.evict_leaf(0).unwrap();
    for k in 0..rows {
        tree.get(k).unwrap();
    }
    (conn, tree, dir)
}

fn bench_walk_and_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("evict_select");
    for rows in [1_000u64, 10_000] {
        let (conn, tree, _dir) = resident_tree(rows);
        let cache = Arc::clone(conn.cache());
        group.bench_with_input(BenchmarkId::new("walk_then_drain", rows), &rows, |b, _| {
            b.iter(|| {
                let queued = cache.insert_candidates(&tree, 100);
                let mut selected = 0;
                while let Some(victim) = cache.select_victim() {
                    victim.page_ref.cas_state(RefState::Locked, RefState::Mem);
                    selected += 1;
                }
                black_box((queued, selected))
            });
        });
    }
    group.finish();
}

fn bench_queue_merge(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let conn = Connection::open(dir.path(), ConnectionConfig::default()).unwrap();
    let tree = conn.create_tree("merge").unwrap();

    let mut group = c.benchmark_group("evict_queue");
    for batch in [10usize, 100, 400] {
        group.bench_with_input(BenchmarkId::new("push_batch", batch), &batch, |b, &n| {
            b.iter_batched(
                || {
                    let queue = EvictQueue::new(400);
                    let candidates: Vec<Candidate> = (0..n as u64)
                        .map(|i| Candidate {
                            tree: Arc::clone(&tree),
                            page_ref: Arc::new(PageRef::new_deleted(i)),
                            // Scrambled so the merge has sorting to do.
                            score: i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40,
                        })
                        .collect();
                    (queue, candidates)
                },
                |(queue, candidates)| {
                    queue.push_batch(candidates);
                    while let Some(c) = queue.pop() {
                        black_box(c.score);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_walk_and_select, bench_queue_merge);
criterion_main!(benches);
