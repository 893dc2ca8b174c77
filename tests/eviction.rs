//! Integration tests for eviction.
//!
//! These tests drive the cache through real connections and trees, with the
//! eviction workers running.

use archengine::cache::EVICT_WOULD_BLOCK;
use archengine::{Connection, ConnectionConfig, RefState, Stat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn open(cache_size: u64) -> (Connection, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let mut config = ConnectionConfig::default();
    config.cache.cache_size = cache_size;
    config.tree.leaf_page_max = 4000;
    (Connection::open(dir.path(), config).unwrap(), dir)
}

/// Many threads racing to evict the same page: exactly one wins.
#[test]
fn test_at_most_one_evictor() {
    let (conn, _dir) = open(64 << 20);
    let tree = conn.create_tree("t").unwrap();
    for k in 0..100u64 {
        tree.put(k, vec![1u8; 64]).unwrap();
    }

    for _round in 0..20 {
        // Make sure the leaf is resident again.
        tree.get(0).unwrap();
        let leaf = tree.leaves().unwrap()[0].clone();
        assert_eq!(leaf.state(), RefState::Mem);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                let leaf = Arc::clone(&leaf);
                let tree = Arc::clone(&tree);
                let cache = Arc::clone(conn.cache());
                thread::spawn(move || {
                    barrier.wait();
                    if leaf.try_lock_for_evict() {
                        wins.fetch_add(1, Ordering::SeqCst);
                        cache.evict_page(&tree, &leaf).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(matches!(leaf.state(), RefState::Disk | RefState::Split));
    }

    for k in 0..100u64 {
        assert_eq!(tree.get(k).unwrap(), Some(vec![1u8; 64]));
    }
}

/// A Ref already in the queue is never queued again.
#[test]
fn test_no_double_queue() {
    let (conn, _dir) = open(64 << 20);
    let tree = conn.create_tree("t").unwrap();
    for k in 0..400u64 {
        tree.put(k, vec![2u8; 100]).unwrap();
    }
    assert!(tree.evict_leaf(0).unwrap());
    for k in 0..400u64 {
        tree.get(k).unwrap();
    }
    let resident = tree
        .leaves()
        .unwrap()
        .iter()
        .filter(|l| l.state() == RefState::Mem)
        .count();
    assert!(resident > 1);

    let cache = conn.cache();
    let first = cache.insert_candidates(&tree, 1000);
    let second = cache.insert_candidates(&tree, 1000);
    assert_eq!(first, resident);
    assert_eq!(second, 0);

    // Popping a candidate frees its Ref to be queued again.
    let victim = cache.select_victim().unwrap();
    assert!(!victim.page_ref.is_queued());
    victim.page_ref.cas_state(RefState::Locked, RefState::Mem);
    assert_eq!(cache.insert_candidates(&tree, 1000), 1);
}

/// A workload several times the cache size stays bounded and loses nothing.
#[test]
fn test_workload_larger_than_cache() {
    let (conn, _dir) = open(1 << 20);
    let tree = conn.create_tree("t").unwrap();
    let rows = 4000u64;

    for k in 0..rows {
        tree.put(k, vec![(k % 251) as u8; 1000]).unwrap();
    }
    assert!(conn.stats().get(Stat::PagesEvicted) > 0);

    for k in 0..rows {
        assert_eq!(tree.get(k).unwrap(), Some(vec![(k % 251) as u8; 1000]));
    }

    // Workers settle the cache below its size once writes stop.
    let cache = conn.cache();
    let deadline = Instant::now() + Duration::from_secs(10);
    while cache.bytes_inuse() >= cache.size() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(cache.bytes_inuse() < cache.size());
    conn.close().unwrap();
}

/// Concurrent readers and writers under pressure never see a missing row.
#[test]
fn test_concurrent_access_under_pressure() {
    let (conn, _dir) = open(512 * 1024);
    let tree = conn.create_tree("t").unwrap();
    for k in 0..2000u64 {
        tree.put(k, k.to_le_bytes().to_vec()).unwrap();
    }

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..2000u64 {
                    let k = (i * 7 + t * 13) % 2000;
                    if i % 3 == 0 {
                        tree.put(k, k.to_le_bytes().to_vec()).unwrap();
                    } else {
                        assert_eq!(tree.get(k).unwrap(), Some(k.to_le_bytes().to_vec()));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(conn.stats().get(Stat::PagesEvicted) > 0);
}

/// Dropping a tree while it has resident pages releases their bytes.
#[test]
fn test_drop_tree_releases_cache() {
    let (conn, _dir) = open(64 << 20);
    let a = conn.create_tree("a").unwrap();
    let b = conn.create_tree("b").unwrap();
    for k in 0..500u64 {
        a.put(k, vec![0u8; 200]).unwrap();
        b.put(k, vec![0u8; 200]).unwrap();
    }
    let before = conn.cache().bytes_inmem();

    conn.drop_tree("a").unwrap();
    assert!(conn.cache().bytes_inmem() < before);
    assert_eq!(conn.cache().tree_count(), 1);
    assert_eq!(conn.cache().flags() & EVICT_WOULD_BLOCK, 0);
    assert_eq!(b.get(1).unwrap(), Some(vec![0u8; 200]));
}
