//! Eviction worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cache::Cache;
use crate::common::Result;

/// Background threads that keep the cache under its eviction target.
///
/// Workers sleep on the cache's eviction condition variable and run passes
/// while [`Cache::needs_eviction`] holds. A pass that evicts nothing sends
/// the worker back to sleep for one wait timeout instead of spinning.
pub struct EvictServer {
    cache: Arc<Cache>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl EvictServer {
    /// Spawn `threads` eviction workers for `cache`.
    ///
    /// # Errors
    /// Returns an error if a thread cannot be spawned; workers already
    /// started are stopped first.
    pub fn start(cache: Arc<Cache>, threads: usize) -> Result<Self> {
        let mut server = Self {
            cache,
            running: Arc::new(AtomicBool::new(true)),
            handles: Vec::with_capacity(threads),
        };

        for id in 0..threads {
            let cache = Arc::clone(&server.cache);
            let running = Arc::clone(&server.running);
            let spawned = std::thread::Builder::new()
                .name(format!("archengine-evict-{}", id))
                .spawn(move || worker_loop(id, &cache, &running));
            match spawned {
                Ok(handle) => server.handles.push(handle),
                Err(e) => {
                    server.stop();
                    return Err(e.into());
                }
            }
        }
        tracing::debug!(threads, "eviction server started");
        Ok(server)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop every worker and wait for it to exit.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) && self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            self.cache.evict_cond().signal();
            if handle.join().is_err() {
                tracing::error!("eviction worker panicked");
            }
        }
        tracing::debug!("eviction server stopped");
    }
}

impl Drop for EvictServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, cache: &Cache, running: &AtomicBool) {
    tracing::trace!(worker = id, "eviction worker started");
    while running.load(Ordering::Acquire) {
        let timeout = cache.eviction_config().wait_timeout;
        cache.evict_cond().wait(timeout);

        while running.load(Ordering::Acquire) && cache.needs_eviction() {
            if cache.evict_pass() == 0 {
                break;
            }
        }
    }
    tracing::trace!(worker = id, "eviction worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockManager;
    use crate::btree::Tree;
    use crate::common::config::{BlockConfig, CacheConfig, EvictionConfig, TreeConfig};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[test]
    fn test_start_and_stop() {
        let cache = Arc::new(Cache::new(
            &CacheConfig::default(),
            &EvictionConfig::default(),
        ));
        let mut server = EvictServer::start(Arc::clone(&cache), 3).unwrap();
        assert_eq!(server.threads(), 3);
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
        server.stop();
    }

    #[test]
    fn test_workers_evict_under_pressure() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &BlockConfig::default())
            .unwrap();
        let eviction = EvictionConfig {
            wait_timeout: Duration::from_millis(10),
            ..EvictionConfig::default()
        };
        let cache = Arc::new(Cache::new(&CacheConfig::default(), &eviction));
        let tree = Arc::new(Tree::new(
            "t",
            Arc::new(bm),
            Arc::clone(&cache),
            TreeConfig {
                leaf_page_max: 1024,
                ..TreeConfig::default()
            },
        ));
        cache.add_tree(Arc::clone(&tree));

        for k in 0..256u64 {
            tree.put(k, vec![1u8; 100]).unwrap();
        }
        assert!(tree.evict_leaf(0).unwrap());
        for k in 0..256u64 {
            tree.get(k).unwrap();
        }

        let _server = EvictServer::start(Arc::clone(&cache), 2).unwrap();
        cache.set_size(cache.bytes_inmem() / 2);

        let deadline = Instant::now() + Duration::from_secs(10);
        while cache.needs_eviction() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!cache.needs_eviction());
        assert!(cache.stats().get(crate::cache::Stat::PagesEvicted) > 1);
    }
}
