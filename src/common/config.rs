//! Configuration for archengine connections.
//!
//! Options arrive either as typed structs or as named values applied with
//! [`ConnectionConfig::set`]. Every change is validated as a whole with
//! [`ConnectionConfig::validate`] before it is allowed to touch running state.

use std::fmt;
use std::time::Duration;

use crate::common::{Error, Result};

/// One megabyte, the unit most size thresholds are expressed in.
pub const MEGABYTE: u64 = 1 << 20;

/// Default block allocation unit (4KB).
///
/// Matches the OS page size on most systems so a single-unit block is one
/// aligned I/O.
pub const ALLOC_SIZE: u64 = 4096;

/// Smallest cache a connection may be configured with.
pub const MIN_CACHE_SIZE: u64 = 64 * 1024;

/// A value for a named configuration option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Int(u64),
    Bool(bool),
    Str(String),
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Int(u64::from(v))
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Int(v) => write!(f, "{}", v),
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl ConfigValue {
    fn as_int(&self, name: &str) -> Result<u64> {
        match self {
            ConfigValue::Int(v) => Ok(*v),
            ConfigValue::Bool(v) => Ok(u64::from(*v)),
            ConfigValue::Str(_) => Err(Error::InvalidConfig(format!(
                "{}: expected an integer, got {}",
                name, self
            ))),
        }
    }

    fn as_str(&self, name: &str) -> Result<&str> {
        match self {
            ConfigValue::Str(v) => Ok(v),
            _ => Err(Error::InvalidConfig(format!(
                "{}: expected a string, got {}",
                name, self
            ))),
        }
    }
}

/// Cache sizing and eviction thresholds.
///
/// All thresholds are percentages of `cache_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Configured cache size in bytes. Managed by the pool in shared mode.
    pub cache_size: u64,
    /// Percent added to tracked bytes to approximate allocator overhead.
    pub overhead_pct: u32,
    /// Percent in use at which application threads must help evict.
    pub eviction_trigger: u32,
    /// Percent in use at which eviction stops.
    pub eviction_target: u32,
    /// Percent dirty at which dirty-only eviction starts.
    pub eviction_dirty_trigger: u32,
    /// Percent dirty at which dirty-only eviction stops.
    pub eviction_dirty_target: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 100 * MEGABYTE,
            overhead_pct: 0,
            eviction_trigger: 95,
            eviction_target: 80,
            eviction_dirty_trigger: 95,
            eviction_dirty_target: 80,
        }
    }
}

/// Eviction worker pool and walk tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Number of background eviction worker threads.
    pub threads: usize,
    /// Pages queued per tree on each walk.
    pub walk_per_file: usize,
    /// Capacity of the candidate queue.
    pub queue_slots: usize,
    /// Longest a worker sleeps before re-checking the cache unprompted.
    pub wait_timeout: Duration,
    /// Rounds an application thread tries before reporting cache full.
    pub app_eviction_attempts: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            walk_per_file: 10,
            queue_slots: 400,
            wait_timeout: Duration::from_millis(100),
            app_eviction_attempts: 100,
        }
    }
}

/// Membership in a named cache pool shared by several connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCacheConfig {
    /// Pool name; connections naming the same pool share it.
    pub name: String,
    /// Total bytes the pool distributes (fixed by the first member).
    pub size: u64,
    /// Largest step a member's cache moves in one rebalancing pass.
    pub chunk: u64,
    /// Ceiling for this member's cache.
    pub quota: u64,
    /// Floor for this member's cache.
    pub reserve: u64,
    /// Consecutive passes that must agree before a member's size changes.
    pub stabilize_passes: u32,
    /// Time between rebalancing passes.
    pub interval: Duration,
}

impl SharedCacheConfig {
    /// A pool of `size` bytes with quota equal to the whole pool and a reserve
    /// of one chunk.
    pub fn new(name: &str, size: u64) -> Self {
        let chunk = (size / 20).max(MIN_CACHE_SIZE);
        Self {
            name: name.to_string(),
            size,
            chunk,
            quota: size,
            reserve: chunk,
            stabilize_passes: 2,
            interval: Duration::from_secs(1),
        }
    }
}

/// Block manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConfig {
    /// Allocation unit; every block is a multiple of this size.
    pub alloc_size: u64,
    /// Files this size or smaller are never compacted, and at least this
    /// many bytes must be recoverable for compaction to proceed.
    pub compact_min_bytes: u64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            alloc_size: ALLOC_SIZE,
            compact_min_bytes: MEGABYTE,
        }
    }
}

/// Tree page shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Leaf images larger than this are written as multiple blocks.
    pub leaf_page_max: usize,
    /// Values at least this long are accounted as overflow bytes.
    pub overflow_threshold: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_page_max: 32 * 1024,
            overflow_threshold: 4096,
        }
    }
}

/// Everything a connection reads at open and reconfiguration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub cache: CacheConfig,
    pub eviction: EvictionConfig,
    pub shared_cache: Option<SharedCacheConfig>,
    pub block: BlockConfig,
    pub tree: TreeConfig,
}

impl ConnectionConfig {
    /// Apply one named option.
    ///
    /// The option is applied to `self` only; call [`validate`] (or go through
    /// [`Connection::reconfigure`]) before using the result.
    ///
    /// [`validate`]: ConnectionConfig::validate
    /// [`Connection::reconfigure`]: crate::conn::Connection::reconfigure
    pub fn set(&mut self, name: &str, value: impl Into<ConfigValue>) -> Result<()> {
        let value = value.into();
        let pct = |v: &ConfigValue| -> Result<u32> {
            let n = v.as_int(name)?;
            u32::try_from(n)
                .map_err(|_| Error::InvalidConfig(format!("{}: {} out of range", name, n)))
        };

        match name {
            "cache_size" => self.cache.cache_size = value.as_int(name)?,
            "cache_overhead" => self.cache.overhead_pct = pct(&value)?,
            "eviction_trigger" => self.cache.eviction_trigger = pct(&value)?,
            "eviction_target" => self.cache.eviction_target = pct(&value)?,
            "eviction_dirty_trigger" => self.cache.eviction_dirty_trigger = pct(&value)?,
            "eviction_dirty_target" => self.cache.eviction_dirty_target = pct(&value)?,
            "eviction.threads" => self.eviction.threads = value.as_int(name)? as usize,
            "eviction.walk_per_file" => {
                self.eviction.walk_per_file = value.as_int(name)? as usize
            }
            "shared_cache.name" => {
                let pool = value.as_str(name)?;
                if pool.is_empty() {
                    self.shared_cache = None;
                } else {
                    let size = self
                        .shared_cache
                        .as_ref()
                        .map_or(self.cache.cache_size, |s| s.size);
                    let mut shared = SharedCacheConfig::new(pool, size);
                    if let Some(old) = self.shared_cache.take() {
                        shared = SharedCacheConfig { name: pool.to_string(), ..old };
                    }
                    self.shared_cache = Some(shared);
                }
            }
            "shared_cache.size"
            | "shared_cache.chunk"
            | "shared_cache.quota"
            | "shared_cache.reserve"
            | "shared_cache.stabilize" => {
                let shared = self.shared_cache.as_mut().ok_or_else(|| {
                    Error::InvalidConfig(format!("{}: shared_cache.name must be set first", name))
                })?;
                let v = value.as_int(name)?;
                match name {
                    "shared_cache.size" => shared.size = v,
                    "shared_cache.chunk" => shared.chunk = v,
                    "shared_cache.quota" => shared.quota = v,
                    "shared_cache.reserve" => shared.reserve = v,
                    _ => shared.stabilize_passes = v as u32,
                }
            }
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "unknown configuration option: {}",
                    name
                )))
            }
        }
        Ok(())
    }

    /// Check the whole configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let c = &self.cache;
        check_range("eviction_trigger", c.eviction_trigger, 10, 99)?;
        check_range("eviction_target", c.eviction_target, 10, 99)?;
        check_range("eviction_dirty_trigger", c.eviction_dirty_trigger, 5, 99)?;
        check_range("eviction_dirty_target", c.eviction_dirty_target, 5, 99)?;
        check_range("cache_overhead", c.overhead_pct, 0, 30)?;
        if c.eviction_target >= c.eviction_trigger {
            return Err(Error::InvalidConfig(
                "eviction target must be lower than the eviction trigger".to_string(),
            ));
        }
        if c.eviction_dirty_target >= c.eviction_dirty_trigger {
            return Err(Error::InvalidConfig(
                "eviction dirty target must be lower than the eviction dirty trigger".to_string(),
            ));
        }
        if self.shared_cache.is_none() && c.cache_size < MIN_CACHE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "cache_size must be at least {} bytes",
                MIN_CACHE_SIZE
            )));
        }

        let e = &self.eviction;
        if e.threads == 0 || e.threads > 20 {
            return Err(Error::InvalidConfig(
                "eviction.threads must be between 1 and 20".to_string(),
            ));
        }
        if e.walk_per_file == 0 || e.queue_slots < e.walk_per_file {
            return Err(Error::InvalidConfig(
                "eviction queue must hold at least one walk of one file".to_string(),
            ));
        }

        if let Some(s) = &self.shared_cache {
            if s.name.is_empty() {
                return Err(Error::InvalidConfig("shared_cache.name is empty".to_string()));
            }
            if s.chunk == 0 || s.chunk > s.size {
                return Err(Error::InvalidConfig(
                    "shared_cache.chunk must be non-zero and no larger than the pool".to_string(),
                ));
            }
            if s.reserve > s.quota || s.quota > s.size {
                return Err(Error::InvalidConfig(
                    "shared_cache requires reserve <= quota <= size".to_string(),
                ));
            }
        }

        let b = &self.block;
        if !b.alloc_size.is_power_of_two() || b.alloc_size < 512 {
            return Err(Error::InvalidConfig(
                "block allocation size must be a power of two of at least 512".to_string(),
            ));
        }
        if self.tree.leaf_page_max < 512 {
            return Err(Error::InvalidConfig(
                "leaf_page_max must be at least 512 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_range(name: &str, v: u32, min: u32, max: u32) -> Result<()> {
    if v < min || v > max {
        return Err(Error::InvalidConfig(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, v
        )));
    }
    Ok(())
}
