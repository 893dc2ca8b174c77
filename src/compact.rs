//! Compaction: move blocks out of the tail of a tree's file.
//!
//! A pass walks the tree and marks clean leaves whose blocks sit in the
//! region the block manager wants to empty as dirty. The following
//! checkpoint rewrites them; first-fit allocation puts the new blocks in
//! free space earlier in the file and freeing the old ones lets the file
//! shrink.
//!
//! ```text
//! skip-check ──► walk ──► rewrite-decide ──► mark dirty ──► finalize
//!     │                         │
//!     └── file not worth it     └── root, dirty, or block already early
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::btree::{PageHandle, RecResult, Tree, WalkFlags};
use crate::cache::Stat;
use crate::common::Result;

/// Options for one compaction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactConfig {
    /// Give up after this long; `None` runs until done.
    pub timeout: Option<Duration>,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(1200)),
        }
    }
}

/// Progress of one compaction call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactState {
    /// Files compaction looked at.
    pub files: u64,
    pub pages_reviewed: u64,
    pub pages_rewritten: u64,
    pub passes: u32,
    /// The block manager judged the file not worth compacting.
    pub skipped: bool,
    /// The time budget ran out before compaction finished.
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Point in time a compaction call must finish by.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    pub(crate) fn expired(&self) -> bool {
        self.0.is_some_and(|d| Instant::now() >= d)
    }
}

/// One compaction pass over `tree`.
///
/// Holds `schema_lock` for the whole pass so no checkpoint runs
/// concurrently, and the tree's flush lock so no other leaf writer does.
/// Returns the number of pages marked for rewrite.
pub(crate) fn compact_pass(
    tree: &Tree,
    schema_lock: &Mutex<()>,
    state: &mut CompactState,
    deadline: Deadline,
) -> Result<u64> {
    let _schema = schema_lock.lock();
    let bm = tree.block_manager();

    if bm.compact_skip()? {
        state.skipped = true;
        tracing::debug!(tree = tree.name(), "compaction skipped by block manager");
        return Ok(0);
    }

    let _flush = tree.flush_lock();
    bm.compact_start()?;
    let walked = walk_pass(tree, state, deadline);
    let ended = bm.compact_end();
    let rewritten = walked?;
    ended?;

    tracing::debug!(
        tree = tree.name(),
        pass = state.passes,
        rewritten,
        reviewed = state.pages_reviewed,
        file_size = bm.size(),
        "compaction pass finished"
    );
    Ok(rewritten)
}

fn walk_pass(tree: &Tree, state: &mut CompactState, deadline: Deadline) -> Result<u64> {
    let stats = tree.cache().stats();
    let mut walk = tree.walk(WalkFlags::NO_GEN | WalkFlags::COMPACT | WalkFlags::WONT_NEED);
    let mut rewritten = 0;

    while let Some(handle) = walk.next()? {
        state.pages_reviewed += 1;
        stats.incr(Stat::CompactPagesReviewed);

        if should_rewrite(tree, &handle)? {
            handle.mark_dirty(tree.cache());
            rewritten += 1;
            state.pages_rewritten += 1;
            stats.incr(Stat::CompactPagesRewritten);
            tracing::trace!(
                tree = tree.name(),
                start_key = handle.page_ref().start_key(),
                "page marked for compaction"
            );
        }
        drop(handle);

        if deadline.expired() {
            state.timed_out = true;
            tracing::debug!(tree = tree.name(), "compaction time budget exhausted");
            break;
        }
    }
    Ok(rewritten)
}

/// Whether the page's current block should move.
///
/// The root and dirty pages are never rewritten here: the root has no block
/// of its own, and dirty pages are written regardless.
fn should_rewrite(tree: &Tree, handle: &PageHandle) -> Result<bool> {
    if handle.is_root() || handle.is_modified() {
        return Ok(false);
    }
    let bm = tree.block_manager();

    if let Some(modify) = handle.modify() {
        // Reconciliation updates the result under the page lock.
        let state = modify.lock();
        match &state.rec_result {
            RecResult::None => {}
            RecResult::Replace(addr) => return Ok(!bm.compact_page_skip(addr)?),
            RecResult::Empty | RecResult::MultiBlock(_) => return Ok(false),
        }
    }

    match handle.page_ref().addr() {
        Some(addr) => Ok(!bm.compact_page_skip(&addr)?),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        assert!(!Deadline::after(None).expired());
        assert!(!Deadline::after(Some(Duration::from_secs(60))).expired());
        assert!(Deadline::after(Some(Duration::ZERO)).expired());
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(
            CompactConfig::default().timeout,
            Some(Duration::from_secs(1200))
        );
    }
}
