//! Connections: the owner of a cache, its trees and its eviction workers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::block::FileBlockManager;
use crate::btree::reconcile::reconcile;
use crate::btree::{Tree, WalkFlags};
use crate::cache::{Cache, CachePool, EvictServer, StatsSnapshot};
use crate::compact::{compact_pass, CompactConfig, CompactState, Deadline};
use crate::common::config::{ConfigValue, ConnectionConfig};
use crate::common::{Error, Result, TreeId};
use crate::conn::registry;

/// Extension of tree files inside the connection's home directory.
pub const TREE_FILE_EXTENSION: &str = "arch";

/// An open engine instance rooted at a home directory.
///
/// Cloning is cheap and every clone refers to the same connection. The
/// connection closes when [`close`](Connection::close) is called or the
/// last clone is dropped; other clones then get
/// [`Error::ConnectionClosed`].
///
/// # Example
/// ```no_run
/// use archengine::{Connection, ConnectionConfig};
///
/// let conn = Connection::open("/tmp/archengine-demo", ConnectionConfig::default()).unwrap();
/// let tree = conn.create_tree("orders").unwrap();
/// tree.put(1, "first order").unwrap();
/// conn.checkpoint("orders").unwrap();
/// conn.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    home: PathBuf,
    config: Mutex<ConnectionConfig>,
    cache: Arc<Cache>,
    trees: RwLock<HashMap<TreeId, Arc<Tree>>>,
    /// Serializes checkpoints, compaction and tree create/drop.
    schema_lock: Mutex<()>,
    evict_server: Mutex<Option<EvictServer>>,
    pool: Option<Arc<CachePool>>,
    closed: AtomicBool,
}

impl Connection {
    /// Open a connection rooted at `home`, creating the directory if needed.
    ///
    /// # Errors
    /// `Error::InvalidConfig` if `config` does not validate, `home` is
    /// already open in this process, or the named cache pool is full.
    pub fn open<P: AsRef<Path>>(home: P, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let home = home.as_ref().to_path_buf();
        std::fs::create_dir_all(&home)?;

        let id = registry::register(&home)?;
        match ConnectionInner::start(id, home, config) {
            Ok(inner) => Ok(Self {
                inner: Arc::new(inner),
            }),
            Err(e) => {
                registry::unregister(id);
                Err(e)
            }
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    /// Current configuration.
    pub fn config(&self) -> ConnectionConfig {
        self.inner.config.lock().clone()
    }

    #[inline]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.inner.cache
    }

    /// The shared cache pool this connection belongs to, if any.
    pub fn cache_pool(&self) -> Option<Arc<CachePool>> {
        self.inner.pool.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.cache.stats().snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Trees
    // ========================================================================

    /// Create a new, empty tree stored in `<home>/<name>.arch`.
    ///
    /// # Errors
    /// `Error::TreeExists` if the tree is open or its file already exists.
    pub fn create_tree(&self, name: &str) -> Result<Arc<Tree>> {
        let inner = &self.inner;
        inner.check_open()?;
        validate_name(name)?;
        let _schema = inner.schema_lock.lock();

        let id = TreeId::from_name(name);
        if inner.trees.read().contains_key(&id) {
            return Err(Error::TreeExists(name.to_string()));
        }

        let (block, tree_config) = {
            let config = inner.config.lock();
            (config.block.clone(), config.tree.clone())
        };
        let bm = FileBlockManager::create(inner.tree_path(name), &block).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                Error::TreeExists(name.to_string())
            }
            other => other,
        })?;

        let tree = Arc::new(Tree::new(
            name,
            Arc::new(bm),
            Arc::clone(&inner.cache),
            tree_config,
        ));
        inner.trees.write().insert(id, Arc::clone(&tree));
        inner.cache.add_tree(Arc::clone(&tree));
        tracing::info!(conn = inner.id, tree = name, "tree created");
        Ok(tree)
    }

    /// An open tree by name.
    pub fn open_tree(&self, name: &str) -> Result<Arc<Tree>> {
        self.inner.check_open()?;
        self.inner.tree(name)
    }

    /// Names of the open trees, sorted.
    pub fn tree_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .trees
            .read()
            .values()
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Drop a tree: its resident pages are discarded without being written
    /// and its file is removed.
    pub fn drop_tree(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        inner.check_open()?;
        let _schema = inner.schema_lock.lock();

        let tree = inner.tree(name)?;
        inner.trees.write().remove(&tree.id());
        inner.cache.remove_tree(tree.id());
        tree.discard();
        std::fs::remove_file(inner.tree_path(name))?;
        tracing::info!(conn = inner.id, tree = name, "tree dropped");
        Ok(())
    }

    // ========================================================================
    // Checkpoint and compaction
    // ========================================================================

    /// Write every dirty resident page of `name` and sync its file.
    ///
    /// Returns the number of pages written.
    pub fn checkpoint(&self, name: &str) -> Result<usize> {
        self.inner.check_open()?;
        let tree = self.inner.tree(name)?;
        self.inner.checkpoint_tree(&tree)
    }

    /// Checkpoint every open tree.
    pub fn checkpoint_all(&self) -> Result<usize> {
        self.inner.check_open()?;
        let trees: Vec<_> = self.inner.trees.read().values().cloned().collect();
        let mut written = 0;
        for tree in &trees {
            written += self.inner.checkpoint_tree(tree)?;
        }
        Ok(written)
    }

    /// Compact `name`: repeat a compaction pass and a checkpoint until a
    /// pass rewrites nothing, the block manager says compaction is not
    /// worthwhile, or the time budget runs out.
    pub fn compact(&self, name: &str, config: &CompactConfig) -> Result<CompactState> {
        let inner = &self.inner;
        inner.check_open()?;
        let tree = inner.tree(name)?;

        let start = Instant::now();
        let deadline = Deadline::after(config.timeout);
        let size_before = tree.block_manager().size();
        let mut state = CompactState {
            files: 1,
            ..CompactState::default()
        };

        loop {
            state.passes += 1;
            let rewritten = compact_pass(&tree, &inner.schema_lock, &mut state, deadline)?;
            if rewritten > 0 {
                inner.checkpoint_tree(&tree)?;
            }
            if rewritten == 0 || state.skipped || state.timed_out {
                break;
            }
            if deadline.expired() {
                state.timed_out = true;
                break;
            }
        }
        state.elapsed = start.elapsed();

        tracing::info!(
            conn = inner.id,
            tree = name,
            passes = state.passes,
            reviewed = state.pages_reviewed,
            rewritten = state.pages_rewritten,
            size_before,
            size_after = tree.block_manager().size(),
            timed_out = state.timed_out,
            "compaction finished"
        );
        Ok(state)
    }

    // ========================================================================
    // Configuration and lifecycle
    // ========================================================================

    /// Apply named options to the running connection.
    ///
    /// The whole change is validated before any of it takes effect. Cache
    /// pool membership is fixed at open.
    ///
    /// # Example
    /// ```no_run
    /// # use archengine::{Connection, ConnectionConfig};
    /// # let conn = Connection::open("/tmp/archengine-demo", ConnectionConfig::default()).unwrap();
    /// conn.reconfigure(&[
    ///     ("eviction_trigger", 90u32.into()),
    ///     ("eviction_target", 70u32.into()),
    /// ])
    /// .unwrap();
    /// ```
    pub fn reconfigure(&self, options: &[(&str, ConfigValue)]) -> Result<()> {
        let inner = &self.inner;
        inner.check_open()?;
        let mut current = inner.config.lock();

        let mut next = current.clone();
        for (name, value) in options {
            next.set(name, value.clone())?;
        }
        next.validate()?;
        if next.shared_cache != current.shared_cache {
            return Err(Error::InvalidConfig(
                "shared cache membership cannot change after open".to_string(),
            ));
        }

        let mut cache_config = next.cache.clone();
        if inner.pool.is_some() {
            cache_config.cache_size = inner.cache.size();
        }
        inner.cache.reconfigure(&cache_config, &next.eviction);

        if next.eviction.threads != current.eviction.threads {
            let mut server = inner.evict_server.lock();
            if let Some(mut old) = server.take() {
                old.stop();
            }
            *server = Some(EvictServer::start(
                Arc::clone(&inner.cache),
                next.eviction.threads,
            )?);
        }

        tracing::info!(conn = inner.id, options = options.len(), "connection reconfigured");
        *current = next;
        Ok(())
    }

    /// Close the connection for every clone.
    ///
    /// Eviction workers stop, resident pages are discarded, and the
    /// connection leaves its cache pool.
    pub fn close(self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("home", &self.inner.home)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionInner {
    fn start(id: u64, home: PathBuf, config: ConnectionConfig) -> Result<Self> {
        let cache = Arc::new(Cache::new(&config.cache, &config.eviction));

        let pool = match &config.shared_cache {
            Some(shared) => Some(registry::join_pool(id, shared, Arc::clone(&cache))?),
            None => None,
        };

        let server = match EvictServer::start(Arc::clone(&cache), config.eviction.threads) {
            Ok(server) => server,
            Err(e) => {
                if let Some(pool) = &pool {
                    registry::leave_pool(id, pool);
                }
                return Err(e);
            }
        };

        tracing::info!(
            conn = id,
            home = %home.display(),
            cache_size = cache.size(),
            pool = pool.as_ref().map(|p| p.name()),
            eviction_threads = server.threads(),
            "connection opened"
        );
        Ok(Self {
            id,
            home,
            config: Mutex::new(config),
            cache,
            trees: RwLock::new(HashMap::new()),
            schema_lock: Mutex::new(()),
            evict_server: Mutex::new(Some(server)),
            pool,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn tree(&self, name: &str) -> Result<Arc<Tree>> {
        self.trees
            .read()
            .get(&TreeId::from_name(name))
            .filter(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| Error::TreeNotFound(name.to_string()))
    }

    fn tree_path(&self, name: &str) -> PathBuf {
        self.home.join(format!("{}.{}", name, TREE_FILE_EXTENSION))
    }

    /// Reconcile every dirty resident leaf of `tree`, then sync its file.
    fn checkpoint_tree(&self, tree: &Tree) -> Result<usize> {
        let _schema = self.schema_lock.lock();
        let _flush = tree.flush_lock();

        let mut walk = tree.walk(WalkFlags::CACHE_ONLY | WalkFlags::NO_GEN);
        let mut written = 0;
        while let Some(handle) = walk.next()? {
            if handle.is_root() {
                continue;
            }
            if reconcile(tree, handle.page_ref(), handle.page())? {
                written += 1;
            }
        }
        tree.block_manager().sync()?;

        tracing::debug!(tree = tree.name(), written, "checkpoint finished");
        Ok(written)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut server) = self.evict_server.lock().take() {
            server.stop();
        }

        let trees: Vec<Arc<Tree>> = self.trees.write().drain().map(|(_, t)| t).collect();
        for tree in &trees {
            self.cache.remove_tree(tree.id());
            tree.discard();
        }

        if let Some(pool) = &self.pool {
            registry::leave_pool(self.id, pool);
        }
        registry::unregister(self.id);
        tracing::info!(conn = self.id, trees = trees.len(), "connection closed");
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\' || c == '\0')
    {
        return Err(Error::InvalidConfig(format!("invalid tree name {:?}", name)));
    }
    Ok(())
}
