//! Integration tests for compaction.

use archengine::{CompactConfig, Connection, ConnectionConfig, Error, RefState, Stat};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const ROWS: u64 = 600;

fn value(k: u64, version: u8) -> Vec<u8> {
    let mut v = vec![version; 200];
    v[..8].copy_from_slice(&k.to_le_bytes());
    v
}

fn open_compactable() -> (Connection, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = ConnectionConfig::default();
    config.block.compact_min_bytes = 0;
    config.tree.leaf_page_max = 4000;
    config.eviction.threads = 1;
    (Connection::open(dir.path(), config).unwrap(), dir)
}

/// Build a file with free space at the front and live blocks at the tail:
/// split the data into many leaves, then rewrite the first half of them.
fn create_fragmented(conn: &Connection) -> Arc<archengine::Tree> {
    let tree = conn.create_tree("frag").unwrap();
    for k in 0..ROWS {
        tree.put(k, value(k, 1)).unwrap();
    }
    assert!(tree.evict_leaf(0).unwrap());
    assert!(tree.leaves().unwrap().len() > 10);

    for k in 0..ROWS / 2 {
        tree.put(k, value(k, 2)).unwrap();
    }
    assert!(conn.checkpoint("frag").unwrap() > 0);
    tree
}

fn expected(k: u64) -> Vec<u8> {
    value(k, if k < ROWS / 2 { 2 } else { 1 })
}

/// Compaction moves tail blocks forward and the file shrinks.
#[test]
fn test_compaction_shrinks_file() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);
    let before = tree.block_manager().size();

    let state = conn.compact("frag", &CompactConfig::default()).unwrap();
    let after = tree.block_manager().size();

    assert!(state.pages_rewritten > 0);
    assert!(state.pages_reviewed >= state.pages_rewritten);
    assert!(!state.timed_out);
    assert!(after < before, "file did not shrink: {} -> {}", before, after);
    assert_eq!(
        conn.stats().get(Stat::CompactPagesRewritten),
        state.pages_rewritten
    );

    for k in 0..ROWS {
        assert_eq!(tree.get(k).unwrap(), Some(expected(k)));
    }
}

/// A second compaction with no intervening writes rewrites nothing.
#[test]
fn test_compaction_is_idempotent() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);

    conn.compact("frag", &CompactConfig::default()).unwrap();
    let size = tree.block_manager().size();

    let second = conn.compact("frag", &CompactConfig::default()).unwrap();
    assert_eq!(second.pages_rewritten, 0);
    assert_eq!(tree.block_manager().size(), size);
}

/// Compaction never touches the root.
#[test]
fn test_root_is_never_rewritten() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);

    conn.compact("frag", &CompactConfig::default()).unwrap();

    let root = tree.root();
    assert_eq!(root.state(), RefState::Mem);
    assert!(root.addr().is_none());
    assert!(!root.page().unwrap().is_modified());
}

/// A file at or below the minimum size is skipped outright.
#[test]
fn test_small_file_is_skipped() {
    let dir = tempdir().unwrap();
    let conn = Connection::open(dir.path(), ConnectionConfig::default()).unwrap();
    let tree = conn.create_tree("small").unwrap();
    for k in 0..100u64 {
        tree.put(k, vec![0u8; 100]).unwrap();
    }
    conn.checkpoint("small").unwrap();

    let state = conn.compact("small", &CompactConfig::default()).unwrap();
    assert!(state.skipped);
    assert_eq!(state.pages_rewritten, 0);
    assert_eq!(state.passes, 1);
}

/// An exhausted time budget ends compaction after the first page.
#[test]
fn test_timeout_stops_compaction() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);

    let config = CompactConfig {
        timeout: Some(Duration::ZERO),
    };
    let state = conn.compact("frag", &config).unwrap();
    assert!(state.timed_out);
    assert_eq!(state.passes, 1);
    assert_eq!(state.pages_reviewed, 1);

    for k in 0..ROWS {
        assert_eq!(tree.get(k).unwrap(), Some(expected(k)));
    }
}

/// Compacting an unknown tree fails cleanly.
#[test]
fn test_compact_missing_tree() {
    let (conn, _dir) = open_compactable();
    assert!(conn.compact("nope", &CompactConfig::default()).is_err());
}

/// Writers keep going while compaction runs; no data is lost.
#[test]
fn test_compaction_with_concurrent_writes() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);

    let writers: Vec<_> = (0..3u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for round in 0..5u8 {
                    for k in (t..ROWS).step_by(3) {
                        tree.put(k, value(k, 10 + round)).unwrap();
                    }
                }
            })
        })
        .collect();

    for _ in 0..5 {
        conn.compact("frag", &CompactConfig::default()).unwrap();
    }
    for w in writers {
        w.join().unwrap();
    }
    conn.checkpoint("frag").unwrap();
    conn.compact("frag", &CompactConfig::default()).unwrap();

    assert!(tree.root().addr().is_none());
    for k in 0..ROWS {
        assert_eq!(tree.get(k).unwrap(), Some(value(k, 14)));
    }
}

/// Another thread keeps dirtying and evicting leaves, so pages are
/// reconciled while compaction moves blocks. The root stays put throughout.
#[test]
fn test_compaction_with_concurrent_eviction() {
    let (conn, _dir) = open_compactable();
    let tree = create_fragmented(&conn);

    let evictor = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for round in 0..20u8 {
                for k in (0..ROWS).step_by(7) {
                    tree.put(k, value(k, 20 + round)).unwrap();
                    match tree.evict_leaf(k) {
                        Ok(_) | Err(Error::Busy) => {}
                        Err(e) => panic!("eviction failed: {}", e),
                    }
                }
            }
        })
    };

    for _ in 0..50 {
        conn.compact("frag", &CompactConfig::default()).unwrap();
        conn.checkpoint("frag").unwrap();

        let root = tree.root();
        assert_eq!(root.state(), RefState::Mem);
        assert!(root.addr().is_none());
    }
    evictor.join().unwrap();
    conn.compact("frag", &CompactConfig::default()).unwrap();

    assert!(tree.root().addr().is_none());
    for k in 0..ROWS {
        let want = if k % 7 == 0 { value(k, 39) } else { expected(k) };
        assert_eq!(tree.get(k).unwrap(), Some(want));
    }
}
