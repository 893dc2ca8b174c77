//! Page references and their state machine.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::btree::{Page, PageKind};
use crate::common::BlockAddr;
use crate::sync::{AtomicFlags, Spinlock};

/// Read generation given to pages that should be evicted first.
pub const READ_GEN_OLDEST: u64 = 1;

/// Ref flag: the Ref sits in the eviction queue.
pub const REF_EVICT_QUEUED: u32 = 0x01;

/// State of a [`PageRef`].
///
/// ```text
///            read                         evict
///  Disk ──▶ Reading ──▶ Mem ──▶ Locked ──▶ Disk | Deleted | Split
///  Deleted ─┘
/// ```
/// `Locked` and `Reading` are owned by exactly one thread, acquired by
/// compare-and-swap. Observers of a transitional state back off and retry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// On disk, not resident.
    Disk = 0,
    /// No disk image; reading instantiates an empty page.
    Deleted = 1,
    /// Held exclusively, usually by an evicting thread.
    Locked = 2,
    /// Resident.
    Mem = 3,
    /// Being read in by one thread.
    Reading = 4,
    /// Replaced in the parent by a split; readers restart from the root.
    Split = 5,
}

impl RefState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RefState::Disk,
            1 => RefState::Deleted,
            2 => RefState::Locked,
            3 => RefState::Mem,
            4 => RefState::Reading,
            _ => RefState::Split,
        }
    }
}

/// What [`PageRef::read_info`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefInfo {
    pub addr: Option<BlockAddr>,
    pub kind: PageKind,
    pub state: RefState,
}

/// One node's slot in its parent.
///
/// Owns the in-memory page while resident. Readers pin the page with a
/// hazard count; an evicting thread moves the state `Mem → Locked` first and
/// then checks the count, and a reader increments the count first and then
/// checks for `Mem`. Both sides use `SeqCst`, so at least one of them sees
/// the other and backs off.
pub struct PageRef {
    state: AtomicU8,
    read_gen: AtomicU64,
    hazards: AtomicU32,
    flags: AtomicFlags,
    start_key: u64,
    kind: PageKind,
    root: bool,
    addr: Spinlock<Option<BlockAddr>>,
    page: Spinlock<Option<Arc<Page>>>,
}

impl PageRef {
    fn new(
        state: RefState,
        start_key: u64,
        kind: PageKind,
        root: bool,
        addr: Option<BlockAddr>,
        page: Option<Arc<Page>>,
    ) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            read_gen: AtomicU64::new(0),
            hazards: AtomicU32::new(0),
            flags: AtomicFlags::new(0),
            start_key,
            kind,
            root,
            addr: Spinlock::new("ref addr", addr),
            page: Spinlock::new("ref page", page),
        }
    }

    /// The root of a tree: internal, resident, never evicted.
    pub fn new_root(page: Arc<Page>) -> Self {
        Self::new(RefState::Mem, 0, PageKind::Internal, true, None, Some(page))
    }

    /// A leaf that has never been written.
    pub fn new_deleted(start_key: u64) -> Self {
        Self::new(RefState::Deleted, start_key, PageKind::Leaf, false, None, None)
    }

    /// A leaf whose image lives at `addr`.
    pub fn new_disk(start_key: u64, addr: BlockAddr) -> Self {
        Self::new(RefState::Disk, start_key, PageKind::Leaf, false, Some(addr), None)
    }

    // ========================================================================
    // State
    // ========================================================================

    #[inline]
    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move `from → to` if the Ref is in `from`.
    #[inline]
    pub fn cas_state(&self, from: RefState, to: RefState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Publish a new state. The caller owns the Ref (`Locked`/`Reading`).
    #[inline]
    pub(crate) fn set_state(&self, state: RefState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Take exclusive ownership of a resident page for eviction.
    ///
    /// At most one of any number of concurrent callers succeeds.
    #[inline]
    pub fn try_lock_for_evict(&self) -> bool {
        self.cas_state(RefState::Mem, RefState::Locked)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.root
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Lowest key this Ref covers.
    #[inline]
    pub fn start_key(&self) -> u64 {
        self.start_key
    }

    /// Address, kind and state without pinning the page. Safe whether or
    /// not the page is resident.
    pub fn read_info(&self) -> RefInfo {
        RefInfo {
            addr: self.addr(),
            kind: self.kind,
            state: self.state(),
        }
    }

    // ========================================================================
    // Read generation
    // ========================================================================

    #[inline]
    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_read_gen(&self, gen: u64) {
        self.read_gen.store(gen, Ordering::Relaxed);
    }

    // ========================================================================
    // Hazard references
    // ========================================================================

    /// Pin the page if it is resident.
    pub(crate) fn hazard_acquire(&self) -> bool {
        self.hazards.fetch_add(1, Ordering::SeqCst);
        if self.state() == RefState::Mem {
            return true;
        }
        self.hazards.fetch_sub(1, Ordering::SeqCst);
        false
    }

    pub(crate) fn hazard_release(&self) {
        self.hazards.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of threads pinning the page.
    #[inline]
    pub fn hazards(&self) -> u32 {
        self.hazards.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Queue membership
    // ========================================================================

    /// Claim the queued flag. Returns `false` if already queued.
    #[inline]
    pub(crate) fn try_mark_queued(&self) -> bool {
        self.flags.try_set(REF_EVICT_QUEUED)
    }

    #[inline]
    pub(crate) fn clear_queued(&self) {
        self.flags.clear(REF_EVICT_QUEUED);
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.flags.contains(REF_EVICT_QUEUED)
    }

    // ========================================================================
    // Address and page
    // ========================================================================

    #[inline]
    pub fn addr(&self) -> Option<BlockAddr> {
        *self.addr.lock()
    }

    pub(crate) fn set_addr(&self, addr: Option<BlockAddr>) {
        *self.addr.lock() = addr;
    }

    /// The resident page. Only meaningful while pinned or owned.
    #[inline]
    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }

    pub(crate) fn set_page(&self, page: Arc<Page>) {
        *self.page.lock() = Some(page);
    }

    pub(crate) fn take_page(&self) -> Option<Arc<Page>> {
        self.page.lock().take()
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("start_key", &self.start_key)
            .field("state", &self.state())
            .field("kind", &self.kind)
            .field("read_gen", &self.read_gen())
            .field("hazards", &self.hazards())
            .field("addr", &self.addr())
            .finish()
    }
}
