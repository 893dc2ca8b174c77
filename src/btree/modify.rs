//! Page modify record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::common::BlockAddr;
use crate::sync::{FairLock, FairLockGuard};

/// Outcome of the most recent reconciliation of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecResult {
    /// Never reconciled; the Ref's own address (if any) is current.
    #[default]
    None,
    /// Reconciled to nothing: the page held no rows.
    Empty,
    /// Reconciled to a single block.
    Replace(BlockAddr),
    /// Reconciled to several blocks; evicting the page splits its parent.
    MultiBlock(Vec<MultiBlockEntry>),
}

impl RecResult {
    /// Every block this result owns.
    pub fn blocks(&self) -> Vec<BlockAddr> {
        match self {
            RecResult::None | RecResult::Empty => Vec::new(),
            RecResult::Replace(addr) => vec![*addr],
            RecResult::MultiBlock(entries) => entries.iter().map(|e| e.addr).collect(),
        }
    }
}

/// One block of a multi-block reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiBlockEntry {
    /// Lowest key the block covers.
    pub start_key: u64,
    pub addr: BlockAddr,
}

/// State protected by the page lock.
#[derive(Debug, Default)]
pub struct ModifyState {
    pub rec_result: RecResult,
}

/// Modification tracking attached to a page on first write.
///
/// A page is dirty while `write_gen > disk_gen`. Writers bump `write_gen`;
/// reconciliation snapshots it before building the image and publishes the
/// snapshot as `disk_gen` afterwards, so a write that races with
/// reconciliation leaves the page dirty.
///
/// The page lock is a [`FairLock`]: reconciliation holds it for the whole
/// write, and compaction takes it only to read the replacement address.
pub struct PageModify {
    write_gen: AtomicU64,
    disk_gen: AtomicU64,
    /// The page's footprint is included in the cache's dirty bytes.
    dirty_accounted: AtomicBool,
    page_lock: FairLock<ModifyState>,
}

impl PageModify {
    pub fn new() -> Self {
        Self {
            write_gen: AtomicU64::new(0),
            disk_gen: AtomicU64::new(0),
            dirty_accounted: AtomicBool::new(false),
            page_lock: FairLock::new(ModifyState::default()),
        }
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.write_gen.load(Ordering::Acquire) > self.disk_gen.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    /// Record a modification.
    pub(crate) fn bump_write_gen(&self) -> u64 {
        self.write_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record that everything up to `gen` is on disk.
    pub(crate) fn set_disk_gen(&self, gen: u64) {
        self.disk_gen.store(gen, Ordering::Release);
    }

    /// Swap the dirty-accounting flag, returning the previous value.
    pub(crate) fn swap_dirty_accounted(&self, accounted: bool) -> bool {
        self.dirty_accounted.swap(accounted, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_dirty_accounted(&self) -> bool {
        self.dirty_accounted.load(Ordering::Acquire)
    }

    /// Take the page lock.
    pub fn lock(&self) -> FairLockGuard<'_, ModifyState> {
        self.page_lock.lock()
    }

    /// Whether the page lock is held (racy, for assertions).
    pub fn is_locked(&self) -> bool {
        self.page_lock.is_locked()
    }
}

impl Default for PageModify {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageModify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageModify")
            .field("write_gen", &self.write_gen.load(Ordering::Relaxed))
            .field("disk_gen", &self.disk_gen.load(Ordering::Relaxed))
            .field("dirty_accounted", &self.is_dirty_accounted())
            .finish()
    }
}
