//! Page cache - accounting, eviction and shared cache pools.
//!
//! # Components
//! - [`Cache`] - connection-wide byte accounting and pressure flags
//! - [`EvictQueue`] / [`Candidate`] - score-ordered eviction candidates
//! - [`EvictServer`] - background eviction workers
//! - [`CachePool`] - one memory budget balanced across connections
//! - [`CacheStats`] - named counters
//!
//! # Eviction flow
//! ```text
//!   put/get ──► app_eviction_check ──► over trigger? ──► evict one / wait
//!                                           │
//!                                           ▼ wake
//!   EvictServer ──► evict_pass ──► fill_queue ──► select_victim ──► evict_page
//! ```

mod evict;
mod page_cache;
mod pool;
mod queue;
mod stats;
mod worker;

pub use evict::EvictOutcome;
pub use page_cache::{
    Cache, CacheUsage, EVICT_AGGRESSIVE, EVICT_ALL, EVICT_CLEAN_SKEW, EVICT_DIRTY,
    EVICT_INT_SKEW, EVICT_STUCK, EVICT_WALK_REVERSE, EVICT_WOULD_BLOCK, READ_GEN_START,
};
pub use pool::{CachePool, PoolMemberInfo};
pub use queue::{Candidate, EvictQueue};
pub use stats::{CacheStats, Stat, StatsSnapshot};
pub use worker::EvictServer;
