//! Process-wide registry of open connections and named cache pools.
//!
//! Created when the first connection opens and torn down when the last one
//! closes. All access goes through its own lock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};

use crate::cache::{Cache, CachePool};
use crate::common::config::SharedCacheConfig;
use crate::common::{Error, Result};

struct Registry {
    next_id: u64,
    /// Connection id to home directory.
    connections: BTreeMap<u64, PathBuf>,
    pools: HashMap<String, Arc<CachePool>>,
}

static REGISTRY: Mutex<Option<Registry>> = const_mutex(None);

/// Record a new connection to `home`, returning its id.
///
/// # Errors
/// `Error::InvalidConfig` if another open connection uses the same home.
pub(crate) fn register(home: &Path) -> Result<u64> {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| {
        tracing::debug!("connection registry created");
        Registry {
            next_id: 1,
            connections: BTreeMap::new(),
            pools: HashMap::new(),
        }
    });

    if registry.connections.values().any(|h| h == home) {
        return Err(Error::InvalidConfig(format!(
            "{} is already open in this process",
            home.display()
        )));
    }
    let id = registry.next_id;
    registry.next_id += 1;
    registry.connections.insert(id, home.to_path_buf());
    Ok(id)
}

/// Forget a connection; the registry goes away with the last one.
pub(crate) fn unregister(id: u64) {
    let mut guard = REGISTRY.lock();
    let Some(registry) = guard.as_mut() else {
        return;
    };
    registry.connections.remove(&id);
    if registry.connections.is_empty() && registry.pools.is_empty() {
        *guard = None;
        tracing::debug!("connection registry torn down");
    }
}

/// Join the pool `config` names, creating it if this is the first member.
///
/// A pool's size, chunk, quota and reserve are fixed by its first member.
pub(crate) fn join_pool(
    id: u64,
    config: &SharedCacheConfig,
    cache: Arc<Cache>,
) -> Result<Arc<CachePool>> {
    let mut guard = REGISTRY.lock();
    let registry = guard.as_mut().ok_or(Error::ConnectionClosed)?;

    let pool = match registry.pools.get(&config.name) {
        Some(pool) => {
            if pool.config().size != config.size {
                tracing::warn!(
                    pool = %config.name,
                    size = pool.config().size,
                    requested = config.size,
                    "joining cache pool with its existing size"
                );
            }
            Arc::clone(pool)
        }
        None => {
            let pool = CachePool::new(config);
            registry
                .pools
                .insert(config.name.clone(), Arc::clone(&pool));
            pool
        }
    };

    if let Err(e) = pool.join(id, cache) {
        if pool.member_count() == 0 {
            registry.pools.remove(&config.name);
        }
        return Err(e);
    }
    Ok(pool)
}

/// Leave `pool`, destroying it when its last member goes.
pub(crate) fn leave_pool(id: u64, pool: &Arc<CachePool>) {
    let mut guard = REGISTRY.lock();
    if pool.leave(id) > 0 {
        return;
    }
    if let Some(registry) = guard.as_mut() {
        registry.pools.remove(pool.name());
        tracing::debug!(pool = pool.name(), "cache pool destroyed");
    }
}

/// Whether the registry currently exists.
pub fn is_active() -> bool {
    REGISTRY.lock().is_some()
}

/// Number of open connections in this process.
pub fn connection_count() -> usize {
    REGISTRY
        .lock()
        .as_ref()
        .map_or(0, |r| r.connections.len())
}

/// The named pool, if any connection has created it.
pub fn cache_pool(name: &str) -> Option<Arc<CachePool>> {
    REGISTRY
        .lock()
        .as_ref()
        .and_then(|r| r.pools.get(name).cloned())
}
