//! Cache statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters incremented by the cache, eviction and compaction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    CacheHits,
    CacheMisses,
    PagesRead,
    BytesRead,
    PagesWritten,
    BytesWritten,
    PagesEvicted,
    BytesEvicted,
    EvictClean,
    EvictDirty,
    EvictInternal,
    EvictFail,
    EvictBusy,
    EvictHazard,
    EvictWrittenBack,
    EvictPasses,
    EvictQueued,
    EvictQueueEmpty,
    EvictStuck,
    ServerWakeups,
    AppEvicts,
    AppWaits,
    CacheFull,
    PageSplits,
    CompactPagesReviewed,
    CompactPagesRewritten,
}

impl Stat {
    pub const COUNT: usize = 26;

    pub const ALL: [Stat; Stat::COUNT] = [
        Stat::CacheHits,
        Stat::CacheMisses,
        Stat::PagesRead,
        Stat::BytesRead,
        Stat::PagesWritten,
        Stat::BytesWritten,
        Stat::PagesEvicted,
        Stat::BytesEvicted,
        Stat::EvictClean,
        Stat::EvictDirty,
        Stat::EvictInternal,
        Stat::EvictFail,
        Stat::EvictBusy,
        Stat::EvictHazard,
        Stat::EvictWrittenBack,
        Stat::EvictPasses,
        Stat::EvictQueued,
        Stat::EvictQueueEmpty,
        Stat::EvictStuck,
        Stat::ServerWakeups,
        Stat::AppEvicts,
        Stat::AppWaits,
        Stat::CacheFull,
        Stat::PageSplits,
        Stat::CompactPagesReviewed,
        Stat::CompactPagesRewritten,
    ];

    /// Name used in snapshots and logs.
    pub fn name(self) -> &'static str {
        match self {
            Stat::CacheHits => "cache_hits",
            Stat::CacheMisses => "cache_misses",
            Stat::PagesRead => "pages_read",
            Stat::BytesRead => "bytes_read",
            Stat::PagesWritten => "pages_written",
            Stat::BytesWritten => "bytes_written",
            Stat::PagesEvicted => "pages_evicted",
            Stat::BytesEvicted => "bytes_evicted",
            Stat::EvictClean => "evict_clean",
            Stat::EvictDirty => "evict_dirty",
            Stat::EvictInternal => "evict_internal",
            Stat::EvictFail => "evict_fail",
            Stat::EvictBusy => "evict_busy",
            Stat::EvictHazard => "evict_hazard",
            Stat::EvictWrittenBack => "evict_written_back",
            Stat::EvictPasses => "evict_passes",
            Stat::EvictQueued => "evict_queued",
            Stat::EvictQueueEmpty => "evict_queue_empty",
            Stat::EvictStuck => "evict_stuck",
            Stat::ServerWakeups => "server_wakeups",
            Stat::AppEvicts => "app_evicts",
            Stat::AppWaits => "app_waits",
            Stat::CacheFull => "cache_full",
            Stat::PageSplits => "page_splits",
            Stat::CompactPagesReviewed => "compact_pages_reviewed",
            Stat::CompactPagesRewritten => "compact_pages_rewritten",
        }
    }
}

/// Statistics tracked by the cache.
///
/// One atomic per [`Stat`], so any thread can bump a counter without
/// locks.
///
/// # Memory Ordering
/// All operations are `Relaxed`: counters are independent and only need
/// atomicity, never ordering against each other.
///
/// # Example
/// ```
/// use archengine::cache::{CacheStats, Stat};
///
/// let stats = CacheStats::new();
/// stats.incr(Stat::CacheHits);
/// assert_eq!(stats.get(Stat::CacheHits), 1);
/// ```
#[derive(Debug)]
pub struct CacheStats {
    counters: [AtomicU64; Stat::COUNT],
}

impl CacheStats {
    /// Create a new stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn incr(&self, stat: Stat) {
        self.add(stat, 1);
    }

    #[inline]
    pub fn add(&self, stat: Stat, n: u64) {
        self.counters[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    /// Calculate cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            values: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of cache statistics.
///
/// Unlike `CacheStats`, this is plain data and can be printed, compared
/// and subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Stat::COUNT],
}

impl StatsSnapshot {
    #[inline]
    pub fn get(&self, stat: Stat) -> u64 {
        self.values[stat as usize]
    }

    /// Calculate cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.get(Stat::CacheHits);
        let total = hits + self.get(Stat::CacheMisses);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Counter increase since `earlier`.
    pub fn delta(&self, earlier: &StatsSnapshot, stat: Stat) -> u64 {
        self.get(stat).saturating_sub(earlier.get(stat))
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stats {{")?;
        for (i, stat) in Stat::ALL.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}: {}", sep, stat.name(), self.get(*stat))?;
        }
        write!(f, ", hit_rate: {:.2}% }}", self.hit_rate() * 100.0)
    }
}
