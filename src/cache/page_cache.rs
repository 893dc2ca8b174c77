//! Cache accounting and pressure state.
//!
//! The [`Cache`] is shared by every tree in a connection. It keeps the byte
//! counters pages report as they come and go, derives the eviction pressure
//! flags from them, and owns the eviction queue and the condition variables
//! eviction workers and throttled application threads sleep on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::btree::{Page, Tree};
use crate::cache::{CacheStats, EvictQueue, Stat};
use crate::common::config::{CacheConfig, EvictionConfig};
use crate::common::TreeId;
use crate::sync::{AtomicFlags, CondVar, Spinlock};

/// Added to an internal page's score so leaves go first.
pub const EVICT_INT_SKEW: u64 = 1 << 20;
/// Added to a clean page's score during a dirty-only pass.
pub const EVICT_CLEAN_SKEW: u64 = 1 << 20;

/// First read generation handed out; everything below is reserved.
pub const READ_GEN_START: u64 = 100;

/// Evict regardless of page state and read generation order.
pub const EVICT_AGGRESSIVE: u32 = 0x01;
/// Walk every tree, not just the next one in rotation.
pub const EVICT_ALL: u32 = 0x02;
/// Dirty bytes are over their trigger; prefer dirty pages.
pub const EVICT_DIRTY: u32 = 0x04;
/// Application threads must help evict before proceeding.
pub const EVICT_WOULD_BLOCK: u32 = 0x08;
/// Walk trees backwards; toggled when a pass gets stuck.
pub const EVICT_WALK_REVERSE: u32 = 0x10;
/// The last pass made no progress.
pub const EVICT_STUCK: u32 = 0x20;

/// A consistent-enough snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub cache_size: u64,
    pub bytes_inmem: u64,
    pub bytes_inuse: u64,
    pub bytes_dirty: u64,
    pub bytes_internal: u64,
    /// Leaf bytes, clamped at zero if the counters are momentarily skewed.
    pub bytes_leaf: u64,
    pub bytes_overflow: u64,
    pub pages_inmem: u64,
    pub pages_dirty: u64,
    pub max_page_size: u64,
}

impl std::fmt::Display for CacheUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache Usage:")?;
        writeln!(f, "  Size:       {}", self.cache_size)?;
        writeln!(
            f,
            "  In memory:  {} bytes in {} pages ({} with overhead)",
            self.bytes_inmem, self.pages_inmem, self.bytes_inuse
        )?;
        writeln!(
            f,
            "  Dirty:      {} bytes in {} pages",
            self.bytes_dirty, self.pages_dirty
        )?;
        writeln!(f, "  Internal:   {}", self.bytes_internal)?;
        writeln!(f, "  Leaf:       {}", self.bytes_leaf)?;
        writeln!(f, "  Overflow:   {}", self.bytes_overflow)?;
        write!(f, "  Max page:   {}", self.max_page_size)
    }
}

/// Eviction thresholds, in percent of the cache size.
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    overhead: u64,
    trigger: u64,
    target: u64,
    dirty_trigger: u64,
    dirty_target: u64,
}

impl From<&CacheConfig> for Thresholds {
    fn from(c: &CacheConfig) -> Self {
        Self {
            overhead: u64::from(c.overhead_pct),
            trigger: u64::from(c.eviction_trigger),
            target: u64::from(c.eviction_target),
            dirty_trigger: u64::from(c.eviction_dirty_trigger),
            dirty_target: u64::from(c.eviction_dirty_target),
        }
    }
}

/// The connection-wide page cache.
///
/// # Accounting
/// Byte counters are updated with atomic adds from any thread. Decrements
/// saturate at zero: concurrent page-in and page-out may briefly observe
/// each other's updates out of order, and a momentary underflow must not
/// wrap into a huge value that trips eviction.
///
/// # Pressure
/// ```text
///   0%          target        trigger       100%
///   │─────────────│──────────────│────────────│
///      idle        workers evict   apps evict too
/// ```
/// Crossing the trigger sets [`EVICT_WOULD_BLOCK`] and wakes the eviction
/// workers; the flag is only cleared once usage falls below the target.
pub struct Cache {
    cache_size: AtomicU64,
    thresholds: RwLock<Thresholds>,
    eviction: RwLock<EvictionConfig>,

    bytes_inmem: AtomicU64,
    pages_inmem: AtomicU64,
    bytes_dirty: AtomicU64,
    pages_dirty: AtomicU64,
    bytes_internal: AtomicU64,
    bytes_overflow: AtomicU64,
    evict_max_page_size: AtomicU64,

    read_gen: AtomicU64,
    pub(crate) flags: AtomicFlags,

    pub(crate) queue: EvictQueue,
    /// Index of the next tree the queue fill visits.
    pub(crate) walk_tree: Spinlock<usize>,
    trees: RwLock<Vec<Arc<Tree>>>,

    /// Eviction workers sleep here.
    evict_cond: CondVar,
    /// Application threads waiting for space sleep here.
    waiter_cond: CondVar,

    stats: CacheStats,
}

impl Cache {
    /// Create a cache sized and tuned by `config`.
    pub fn new(config: &CacheConfig, eviction: &EvictionConfig) -> Self {
        Self {
            cache_size: AtomicU64::new(config.cache_size),
            thresholds: RwLock::new(Thresholds::from(config)),
            eviction: RwLock::new(eviction.clone()),
            bytes_inmem: AtomicU64::new(0),
            pages_inmem: AtomicU64::new(0),
            bytes_dirty: AtomicU64::new(0),
            pages_dirty: AtomicU64::new(0),
            bytes_internal: AtomicU64::new(0),
            bytes_overflow: AtomicU64::new(0),
            evict_max_page_size: AtomicU64::new(0),
            read_gen: AtomicU64::new(READ_GEN_START),
            flags: AtomicFlags::new(0),
            queue: EvictQueue::new(eviction.queue_slots),
            walk_tree: Spinlock::new("evict walk tree", 0),
            trees: RwLock::new(Vec::new()),
            evict_cond: CondVar::new("evict server"),
            waiter_cond: CondVar::new("evict waiters"),
            stats: CacheStats::new(),
        }
    }

    /// Apply new thresholds and eviction tuning to a running cache.
    ///
    /// The queue keeps the slot count it was created with.
    pub fn reconfigure(&self, config: &CacheConfig, eviction: &EvictionConfig) {
        *self.thresholds.write() = Thresholds::from(config);
        *self.eviction.write() = eviction.clone();
        self.set_size(config.cache_size);
    }

    // ========================================================================
    // Size and thresholds
    // ========================================================================

    #[inline]
    pub fn size(&self) -> u64 {
        self.cache_size.load(Ordering::Relaxed)
    }

    /// Resize the cache and re-evaluate pressure.
    ///
    /// Called by reconfiguration and by the cache pool manager.
    pub fn set_size(&self, size: u64) {
        let old = self.cache_size.swap(size, Ordering::Relaxed);
        if old != size {
            tracing::debug!(from = old, to = size, "cache resized");
        }
        self.update_pressure();
    }

    pub(crate) fn eviction_config(&self) -> EvictionConfig {
        self.eviction.read().clone()
    }

    // ========================================================================
    // Counters
    // ========================================================================

    #[inline]
    pub fn bytes_inmem(&self) -> u64 {
        self.bytes_inmem.load(Ordering::Relaxed)
    }

    /// In-memory bytes scaled by the configured overhead.
    pub fn bytes_inuse(&self) -> u64 {
        let overhead = self.thresholds.read().overhead;
        let scaled = u128::from(self.bytes_inmem()) * u128::from(100 + overhead) / 100;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    #[inline]
    pub fn pages_inmem(&self) -> u64 {
        self.pages_inmem.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_dirty(&self) -> u64 {
        self.bytes_dirty.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pages_dirty(&self) -> u64 {
        self.pages_dirty.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_internal(&self) -> u64 {
        self.bytes_internal.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_overflow(&self) -> u64 {
        self.bytes_overflow.load(Ordering::Relaxed)
    }

    /// Largest page footprint evicted so far.
    #[inline]
    pub fn evict_max_page_size(&self) -> u64 {
        self.evict_max_page_size.load(Ordering::Relaxed)
    }

    /// Snapshot the counters, deriving leaf bytes as in-use bytes less
    /// internal and overflow bytes.
    pub fn stats_update(&self) -> CacheUsage {
        let bytes_inuse = self.bytes_inuse();
        let bytes_internal = self.bytes_internal();
        let bytes_overflow = self.bytes_overflow();
        CacheUsage {
            cache_size: self.size(),
            bytes_inmem: self.bytes_inmem(),
            bytes_inuse,
            bytes_dirty: self.bytes_dirty(),
            bytes_internal,
            bytes_leaf: bytes_inuse.saturating_sub(bytes_internal + bytes_overflow),
            bytes_overflow,
            pages_inmem: self.pages_inmem(),
            pages_dirty: self.pages_dirty(),
            max_page_size: self.evict_max_page_size(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Next read generation; pages with lower generations are evicted first.
    #[inline]
    pub fn next_read_gen(&self) -> u64 {
        self.read_gen.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current read generation without advancing it.
    #[inline]
    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    /// A page of `footprint` bytes entered the cache.
    pub fn page_in(&self, footprint: usize, overflow: usize, internal: bool) {
        let bytes = footprint as u64;
        self.bytes_inmem.fetch_add(bytes, Ordering::Relaxed);
        self.pages_inmem.fetch_add(1, Ordering::Relaxed);
        self.bytes_overflow
            .fetch_add(overflow as u64, Ordering::Relaxed);
        if internal {
            self.bytes_internal.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// `page` left the cache.
    pub fn page_out(&self, page: &Page) {
        let bytes = page.footprint() as u64;
        sub_saturating(&self.bytes_inmem, bytes);
        sub_saturating(&self.pages_inmem, 1);
        sub_saturating(&self.bytes_overflow, page.overflow_bytes() as u64);
        if page.is_internal() {
            sub_saturating(&self.bytes_internal, bytes);
        }
        if let Some(modify) = page.modify() {
            if modify.swap_dirty_accounted(false) {
                self.dirty_decr(bytes);
            }
        }
    }

    /// A resident page grew or shrank.
    pub fn bytes_adjust(&self, delta: i64, ovfl_delta: i64, internal: bool) {
        add_signed(&self.bytes_inmem, delta);
        add_signed(&self.bytes_overflow, ovfl_delta);
        if internal {
            add_signed(&self.bytes_internal, delta);
        }
    }

    /// A clean page of `bytes` became dirty.
    pub fn dirty_incr(&self, bytes: u64) {
        self.bytes_dirty.fetch_add(bytes, Ordering::Relaxed);
        self.pages_dirty.fetch_add(1, Ordering::Relaxed);
    }

    /// A dirty page of `bytes` became clean or left the cache.
    pub fn dirty_decr(&self, bytes: u64) {
        sub_saturating(&self.bytes_dirty, bytes);
        sub_saturating(&self.pages_dirty, 1);
    }

    /// An already-dirty page grew or shrank.
    pub fn dirty_adjust(&self, delta: i64) {
        add_signed(&self.bytes_dirty, delta);
    }

    pub(crate) fn record_evicted(&self, bytes: u64) {
        self.evict_max_page_size.fetch_max(bytes, Ordering::Relaxed);
    }

    // ========================================================================
    // Pressure
    // ========================================================================

    /// Recompute the pressure flags from the counters.
    ///
    /// Sets [`EVICT_AGGRESSIVE`] above the trigger and clears it below the
    /// target, and likewise [`EVICT_DIRTY`] for dirty bytes. Wakes the
    /// eviction workers when [`EVICT_WOULD_BLOCK`] becomes set and waiting
    /// application threads when it clears. Returns whether application
    /// threads should help evict.
    pub fn update_pressure(&self) -> bool {
        let t = *self.thresholds.read();
        let size = u128::from(self.size());
        let inuse = u128::from(self.bytes_inuse()) * 100;
        let dirty = u128::from(self.bytes_dirty()) * 100;

        if inuse > size * u128::from(t.trigger) {
            self.set_flag(EVICT_AGGRESSIVE);
        } else if inuse < size * u128::from(t.target) {
            self.clear_flag(EVICT_AGGRESSIVE);
        }
        if dirty > size * u128::from(t.dirty_trigger) {
            self.set_flag(EVICT_DIRTY);
        } else if dirty < size * u128::from(t.dirty_target) {
            self.clear_flag(EVICT_DIRTY);
        }

        if self.flags.intersects(EVICT_AGGRESSIVE | EVICT_DIRTY) {
            if self.set_flag(EVICT_WOULD_BLOCK) {
                tracing::debug!(
                    inuse = self.bytes_inuse(),
                    dirty = self.bytes_dirty(),
                    size = self.size(),
                    "cache over eviction trigger"
                );
                self.wake_server();
            }
            true
        } else {
            if self.clear_flag(EVICT_WOULD_BLOCK) {
                tracing::debug!(inuse = self.bytes_inuse(), "cache back under eviction target");
                self.waiter_cond.signal();
            }
            false
        }
    }

    /// Whether eviction workers have anything to do: usage is above the
    /// target, dirty bytes are above the dirty target, or a pressure flag is
    /// still set.
    pub fn needs_eviction(&self) -> bool {
        let t = *self.thresholds.read();
        let size = u128::from(self.size());
        u128::from(self.bytes_inuse()) * 100 > size * u128::from(t.target)
            || u128::from(self.bytes_dirty()) * 100 > size * u128::from(t.dirty_target)
            || self.flags.contains(EVICT_WOULD_BLOCK)
    }

    #[inline]
    pub fn is_would_block(&self) -> bool {
        self.flags.contains(EVICT_WOULD_BLOCK)
    }

    #[inline]
    pub fn is_aggressive(&self) -> bool {
        self.flags.contains(EVICT_AGGRESSIVE)
    }

    /// Raw pressure flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.bits()
    }

    /// Set `bit`, returning whether it was previously clear.
    fn set_flag(&self, bit: u32) -> bool {
        !self.flags.contains(bit) && self.flags.set(bit) & bit == 0
    }

    /// Clear `bit`, returning whether it was previously set.
    fn clear_flag(&self, bit: u32) -> bool {
        self.flags.contains(bit) && self.flags.clear(bit) & bit != 0
    }

    /// Wake the eviction workers.
    pub fn wake_server(&self) {
        self.stats.incr(Stat::ServerWakeups);
        self.evict_cond.signal();
    }

    pub(crate) fn evict_cond(&self) -> &CondVar {
        &self.evict_cond
    }

    pub(crate) fn waiter_cond(&self) -> &CondVar {
        &self.waiter_cond
    }

    // ========================================================================
    // Trees
    // ========================================================================

    /// Make `tree` visible to eviction.
    pub fn add_tree(&self, tree: Arc<Tree>) {
        self.trees.write().push(tree);
    }

    /// Hide the tree from eviction and drop its queued candidates.
    pub fn remove_tree(&self, id: TreeId) -> Option<Arc<Tree>> {
        let removed = {
            let mut trees = self.trees.write();
            let pos = trees.iter().position(|t| t.id() == id)?;
            trees.remove(pos)
        };
        self.queue.purge(id);
        Some(removed)
    }

    /// Trees currently visible to eviction.
    pub fn trees(&self) -> Vec<Arc<Tree>> {
        self.trees.read().clone()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.read().len()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.size())
            .field("bytes_inmem", &self.bytes_inmem())
            .field("bytes_dirty", &self.bytes_dirty())
            .field("flags", &self.flags)
            .field("trees", &self.tree_count())
            .finish()
    }
}

fn sub_saturating(counter: &AtomicU64, n: u64) {
    if n == 0 {
        return;
    }
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(n))
    });
}

fn add_signed(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        sub_saturating(counter, delta.unsigned_abs());
    }
}
