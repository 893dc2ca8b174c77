//! Keyed two-level B-tree.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::block::BlockManager;
use crate::btree::{
    MultiBlockEntry, Page, PageHandle, PageRef, RefState, TreeWalk, WalkFlags, READ_GEN_OLDEST,
};
use crate::cache::{Cache, EvictOutcome, Stat, EVICT_CLEAN_SKEW, EVICT_INT_SKEW};
use crate::common::config::TreeConfig;
use crate::common::{fatal, Error, Result, TreeId};
use crate::sync::{Backoff, Spinlock, SpinlockGuard};

/// An ordered `u64 → bytes` map stored in its own file.
///
/// # Structure
/// ```text
///                  ┌───────────────────────┐
///                  │ root (internal, Mem)  │
///                  └───────────┬───────────┘
///        ┌─────────────┬───────┴─────┬─────────────┐
///   [0, k1)       [k1, k2)      [k2, k3)       [k3, ∞)
///    leaf           leaf          leaf           leaf
/// ```
/// The root is resident for the tree's lifetime and is never evicted or
/// compacted. Leaves are keyed by their start key; evicting a leaf that
/// reconciled to several blocks splits it into several on-disk leaves.
///
/// # Thread Safety
/// Leaves are reached through the Ref state machine and pinned with
/// [`PageHandle`]s. `flush_lock` excludes checkpoint and compaction from
/// each other on the same tree.
pub struct Tree {
    id: TreeId,
    name: String,
    root: Arc<PageRef>,
    bm: Arc<dyn BlockManager>,
    cache: Arc<Cache>,
    config: TreeConfig,
    flush_lock: Spinlock<()>,
    /// Start key of the next leaf the eviction walk looks at.
    evict_pos: Spinlock<Option<u64>>,
    dead: AtomicBool,
}

impl Tree {
    /// Create an empty tree over `bm`, accounted in `cache`.
    pub fn new(
        name: &str,
        bm: Arc<dyn BlockManager>,
        cache: Arc<Cache>,
        config: TreeConfig,
    ) -> Self {
        let first_leaf = Arc::new(PageRef::new_deleted(0));
        let root_page = Arc::new(Page::new_internal(vec![first_leaf]));
        cache.page_in(root_page.footprint(), 0, true);

        let root = Arc::new(PageRef::new_root(root_page));
        root.set_read_gen(cache.next_read_gen());

        Self {
            id: TreeId::from_name(name),
            name: name.to_string(),
            root,
            bm,
            cache,
            config,
            flush_lock: Spinlock::new("tree flush", ()),
            evict_pos: Spinlock::new("evict walk", None),
            dead: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> TreeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn root(&self) -> &Arc<PageRef> {
        &self.root
    }

    #[inline]
    pub fn block_manager(&self) -> &Arc<dyn BlockManager> {
        &self.bm
    }

    #[inline]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[inline]
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Dropped or closed; pages are discarded, not written.
    ///
    /// `SeqCst` pairs with the Ref state and hazard updates: a reader that
    /// publishes `Reading` or a hazard and then finds the tree alive is
    /// seen by `discard`, which waits for it.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn flush_lock(&self) -> SpinlockGuard<'_, ()> {
        self.flush_lock.lock()
    }

    // ========================================================================
    // Public API: rows
    // ========================================================================

    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let handle = self.leaf_for(key, WalkFlags::empty())?;
        Ok(handle.get(key))
    }

    /// Insert or replace `key`.
    ///
    /// # Errors
    /// `Error::CacheFull` if the cache is over its trigger and eviction
    /// cannot make room.
    pub fn put(&self, key: u64, value: impl Into<Vec<u8>>) -> Result<()> {
        self.check_open()?;
        self.cache.app_eviction_check()?;

        let handle = self.leaf_for(key, WalkFlags::empty())?;
        handle.put(&self.cache, key, value.into())
    }

    /// Remove `key`, returning whether it existed.
    pub fn remove(&self, key: u64) -> Result<bool> {
        self.check_open()?;
        let handle = self.leaf_for(key, WalkFlags::empty())?;
        handle.remove(&self.cache, key)
    }

    /// Walk the tree with `flags`.
    pub fn walk(&self, flags: WalkFlags) -> TreeWalk<'_> {
        TreeWalk::new(self, flags)
    }

    /// Try to evict the leaf holding `key`.
    ///
    /// Returns `Ok(false)` if the leaf is not resident, another thread
    /// owns it, or a dirty-only pass only wrote it back.
    pub fn evict_leaf(&self, key: u64) -> Result<bool> {
        self.check_open()?;
        let leaf = self.child_for(key)?;
        if !leaf.try_lock_for_evict() {
            return Ok(false);
        }
        let outcome = self.cache.evict_page(self, &leaf)?;
        Ok(outcome == EvictOutcome::Evicted)
    }

    /// Snapshot of the root's children.
    pub fn leaves(&self) -> Result<Vec<Arc<PageRef>>> {
        let root = self.root_page()?;
        let children = root.children().ok_or(Error::PageNotFound)?;
        let snapshot = children.read().clone();
        Ok(snapshot)
    }

    // ========================================================================
    // Navigation and page reads
    // ========================================================================

    fn check_open(&self) -> Result<()> {
        if self.is_dead() {
            return Err(Error::TreeNotFound(self.name.clone()));
        }
        Ok(())
    }

    fn root_page(&self) -> Result<Arc<Page>> {
        self.root
            .page()
            .ok_or_else(|| Error::TreeNotFound(self.name.clone()))
    }

    /// The leaf whose range holds `key`.
    fn child_for(&self, key: u64) -> Result<Arc<PageRef>> {
        let root = self.root_page()?;
        let children = root.children().ok_or(Error::PageNotFound)?.read();
        let idx = children.partition_point(|c| c.start_key() <= key);
        match idx.checked_sub(1).and_then(|i| children.get(i)) {
            Some(child) => Ok(Arc::clone(child)),
            None => fatal("tree root has no leaf covering key 0"),
        }
    }

    /// The first leaf starting at or after `key`.
    pub(crate) fn child_at_or_after(&self, key: u64) -> Result<Option<Arc<PageRef>>> {
        let root = self.root_page()?;
        let children = root.children().ok_or(Error::PageNotFound)?.read();
        let idx = children.partition_point(|c| c.start_key() < key);
        Ok(children.get(idx).cloned())
    }

    /// Descend to the leaf for `key`, restarting if it splits underneath.
    fn leaf_for(&self, key: u64, flags: WalkFlags) -> Result<PageHandle> {
        loop {
            let leaf = self.child_for(key)?;
            match self.page_in(&leaf, flags) {
                Err(Error::PageNotFound) => continue,
                other => return other,
            }
        }
    }

    /// Pin `page_ref`'s page, reading it in if needed.
    ///
    /// # Errors
    /// `Error::PageNotFound` if the Ref was split away; the caller restarts
    /// from the root. `Error::TreeNotFound` once the tree is dropped or
    /// closed.
    pub fn page_in(&self, page_ref: &Arc<PageRef>, flags: WalkFlags) -> Result<PageHandle> {
        let mut backoff = Backoff::new();
        loop {
            self.check_open()?;
            match page_ref.state() {
                RefState::Mem => {
                    if let Some(handle) = self.pin(page_ref, flags) {
                        self.cache.stats().incr(Stat::CacheHits);
                        return Ok(handle);
                    }
                }
                RefState::Disk | RefState::Deleted => {
                    self.cache.app_eviction_check()?;
                    self.read_page(page_ref, flags)?;
                }
                RefState::Locked | RefState::Reading => backoff.snooze(),
                RefState::Split => return Err(Error::PageNotFound),
            }
        }
    }

    /// Pin `page_ref`'s page only if it is resident, waiting out transient
    /// states.
    pub(crate) fn page_if_resident(
        &self,
        page_ref: &Arc<PageRef>,
        flags: WalkFlags,
    ) -> Option<PageHandle> {
        let mut backoff = Backoff::new();
        loop {
            if self.is_dead() {
                return None;
            }
            match page_ref.state() {
                RefState::Mem => {
                    if let Some(handle) = self.pin(page_ref, flags) {
                        return Some(handle);
                    }
                }
                RefState::Locked | RefState::Reading => backoff.snooze(),
                RefState::Disk | RefState::Deleted | RefState::Split => return None,
            }
        }
    }

    fn pin(&self, page_ref: &Arc<PageRef>, flags: WalkFlags) -> Option<PageHandle> {
        if !page_ref.hazard_acquire() {
            return None;
        }
        if self.is_dead() {
            page_ref.hazard_release();
            return None;
        }
        let Some(page) = page_ref.page() else {
            fatal("resident Ref without a page");
        };
        if !flags.contains(WalkFlags::NO_GEN) {
            page_ref.set_read_gen(self.cache.next_read_gen());
        }
        Some(PageHandle::new(Arc::clone(page_ref), page))
    }

    /// Bring an on-disk or deleted leaf into memory.
    ///
    /// A dead tree's pages are never charged to the cache again: once the
    /// tree is gone nothing would evict them.
    fn read_page(&self, page_ref: &PageRef, flags: WalkFlags) -> Result<()> {
        let prior = page_ref.state();
        if !matches!(prior, RefState::Disk | RefState::Deleted)
            || !page_ref.cas_state(prior, RefState::Reading)
        {
            return Ok(());
        }
        if self.is_dead() {
            page_ref.set_state(prior);
            return Err(Error::TreeNotFound(self.name.clone()));
        }

        let page = match self.load(page_ref, prior) {
            Ok(page) => page,
            Err(e) => {
                page_ref.set_state(prior);
                return Err(e);
            }
        };

        self.cache
            .page_in(page.footprint(), page.overflow_bytes(), page.is_internal());
        page_ref.set_page(Arc::new(page));
        page_ref.set_read_gen(if flags.contains(WalkFlags::WONT_NEED) {
            READ_GEN_OLDEST
        } else {
            self.cache.next_read_gen()
        });
        page_ref.set_state(RefState::Mem);
        self.cache.stats().incr(Stat::CacheMisses);
        Ok(())
    }

    fn load(&self, page_ref: &PageRef, prior: RefState) -> Result<Page> {
        if prior == RefState::Deleted {
            return Ok(Page::new_leaf(BTreeMap::new(), self.config.overflow_threshold));
        }
        let Some(addr) = page_ref.addr() else {
            fatal("on-disk Ref without an address");
        };

        let image = self.bm.read(&addr)?;
        let rows = Page::decode_rows(&image, addr.offset)?;
        self.cache.stats().incr(Stat::PagesRead);
        self.cache.stats().add(Stat::BytesRead, u64::from(addr.size));
        tracing::trace!(tree = %self.name, addr = %self.bm.addr_string(&addr), "page read");
        Ok(Page::new_leaf(rows, self.config.overflow_threshold))
    }

    // ========================================================================
    // Eviction support
    // ========================================================================

    /// Collect up to `max` resident, unqueued leaves from the persistent walk
    /// position, claiming their queued flag. Returns `(ref, score)` pairs.
    pub(crate) fn evict_walk(
        &self,
        max: usize,
        reverse: bool,
        dirty_pass: bool,
    ) -> Vec<(Arc<PageRef>, u64)> {
        let mut out = Vec::new();
        let Ok(leaves) = self.leaves() else {
            return out;
        };
        if leaves.is_empty() || max == 0 || self.is_dead() {
            return out;
        }

        let mut pos = self.evict_pos.lock();
        let n = leaves.len();
        let start = match (*pos, reverse) {
            (None, false) => 0,
            (None, true) => n - 1,
            (Some(k), false) => leaves.partition_point(|c| c.start_key() < k) % n,
            (Some(k), true) => leaves
                .partition_point(|c| c.start_key() <= k)
                .checked_sub(1)
                .unwrap_or(n - 1),
        };

        let mut idx = start;
        for _ in 0..n {
            let leaf = &leaves[idx];
            idx = if reverse { (idx + n - 1) % n } else { (idx + 1) % n };

            if leaf.is_root() || leaf.state() != RefState::Mem {
                continue;
            }
            let Some(page) = leaf.page() else {
                continue;
            };
            if !leaf.try_mark_queued() {
                continue;
            }

            let mut score = leaf.read_gen();
            if page.is_internal() {
                score = score.saturating_add(EVICT_INT_SKEW);
            }
            if dirty_pass && !page.is_modified() {
                score = score.saturating_add(EVICT_CLEAN_SKEW);
            }
            out.push((Arc::clone(leaf), score));
            if out.len() >= max {
                break;
            }
        }
        *pos = Some(leaves[idx].start_key());
        out
    }

    /// Replace a leaf that reconciled to several blocks with one on-disk
    /// leaf per block.
    pub(crate) fn split(&self, page_ref: &Arc<PageRef>, blocks: &[MultiBlockEntry]) -> Result<()> {
        let root = self.root_page()?;
        let replacements: Vec<_> = blocks
            .iter()
            .map(|b| Arc::new(PageRef::new_disk(b.start_key, b.addr)))
            .collect();
        if !root.replace_child(&self.cache, page_ref, replacements) {
            fatal("split leaf is not a child of the root");
        }
        self.cache.stats().incr(Stat::PageSplits);
        tracing::debug!(
            tree = %self.name,
            start_key = page_ref.start_key(),
            blocks = blocks.len(),
            "leaf split"
        );
        Ok(())
    }

    /// Mark the tree dead and drop every resident page without writing it.
    pub(crate) fn discard(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let leaves = self.leaves().unwrap_or_default();
        for leaf in &leaves {
            let mut backoff = Backoff::new();
            loop {
                match leaf.state() {
                    RefState::Mem => {
                        if !leaf.try_lock_for_evict() {
                            continue;
                        }
                        if leaf.hazards() > 0 {
                            leaf.set_state(RefState::Mem);
                            backoff.snooze();
                            continue;
                        }
                        if let Some(page) = leaf.take_page() {
                            self.cache.page_out(&page);
                        }
                        leaf.set_state(RefState::Deleted);
                        break;
                    }
                    RefState::Locked | RefState::Reading => backoff.snooze(),
                    RefState::Disk | RefState::Deleted | RefState::Split => break,
                }
            }
        }

        if let Some(root) = self.root.take_page() {
            self.cache.page_out(&root);
        }
        tracing::debug!(tree = %self.name, leaves = leaves.len(), "tree discarded");
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockManager;
    use crate::common::config::{BlockConfig, CacheConfig, EvictionConfig};
    use tempfile::{tempdir, TempDir};

    fn tree_with(leaf_page_max: usize) -> (Tree, TempDir) {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &BlockConfig::default())
            .unwrap();
        let cache = Arc::new(Cache::new(
            &CacheConfig::default(),
            &EvictionConfig::default(),
        ));
        let config = TreeConfig {
            leaf_page_max,
            ..TreeConfig::default()
        };
        (Tree::new("t", Arc::new(bm), cache, config), dir)
    }

    #[test]
    fn test_put_get_remove() {
        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(1, b"one".to_vec()).unwrap();
        tree.put(2, "two").unwrap();

        assert_eq!(tree.get(1).unwrap(), Some(b"one".to_vec()));
        assert_eq!(tree.get(2).unwrap(), Some(b"two".to_vec()));
        assert_eq!(tree.get(3).unwrap(), None);

        assert!(tree.remove(1).unwrap());
        assert!(!tree.remove(1).unwrap());
        assert_eq!(tree.get(1).unwrap(), None);
    }

    #[test]
    fn test_evict_and_read_back() {
        let (tree, _dir) = tree_with(32 * 1024);
        for k in 0..100u64 {
            tree.put(k, k.to_le_bytes().to_vec()).unwrap();
        }
        let before = tree.cache().bytes_inmem();

        assert!(tree.evict_leaf(0).unwrap());
        let leaf = tree.child_for(0).unwrap();
        assert_eq!(leaf.state(), RefState::Disk);
        assert!(leaf.addr().is_some());
        assert!(tree.cache().bytes_inmem() < before);
        assert_eq!(tree.cache().bytes_dirty(), 0);

        // Not resident any more.
        assert!(!tree.evict_leaf(0).unwrap());

        for k in 0..100u64 {
            assert_eq!(tree.get(k).unwrap(), Some(k.to_le_bytes().to_vec()));
        }
        assert_eq!(tree.child_for(0).unwrap().state(), RefState::Mem);
    }

    #[test]
    fn test_large_leaf_splits_on_eviction() {
        let (tree, _dir) = tree_with(1024);
        for k in 0..64u64 {
            tree.put(k, vec![k as u8; 100]).unwrap();
        }
        assert_eq!(tree.leaves().unwrap().len(), 1);

        assert!(tree.evict_leaf(0).unwrap());
        let leaves = tree.leaves().unwrap();
        assert!(leaves.len() > 1);
        assert_eq!(leaves[0].start_key(), 0);
        assert!(leaves.windows(2).all(|w| w[0].start_key() < w[1].start_key()));
        assert!(leaves.iter().all(|l| l.state() == RefState::Disk));

        for k in 0..64u64 {
            assert_eq!(tree.get(k).unwrap(), Some(vec![k as u8; 100]));
        }
    }

    #[test]
    fn test_pinned_leaf_is_not_evicted() {
        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(5, "five").unwrap();

        let leaf = tree.child_for(5).unwrap();
        let handle = tree.page_in(&leaf, WalkFlags::empty()).unwrap();
        assert!(matches!(tree.evict_leaf(5), Err(Error::Busy)));
        assert_eq!(leaf.state(), RefState::Mem);

        drop(handle);
        assert!(tree.evict_leaf(5).unwrap());
    }

    #[test]
    fn test_read_generation_publishing() {
        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(1, "x").unwrap();
        let leaf = tree.child_for(1).unwrap();

        let gen = leaf.read_gen();
        tree.get(1).unwrap();
        assert!(leaf.read_gen() > gen);

        let gen = leaf.read_gen();
        drop(tree.page_in(&leaf, WalkFlags::NO_GEN).unwrap());
        assert_eq!(leaf.read_gen(), gen);
    }

    #[test]
    fn test_wont_need_reads_get_oldest_generation() {
        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(1, "x").unwrap();
        assert!(tree.evict_leaf(1).unwrap());

        let leaf = tree.child_for(1).unwrap();
        drop(tree.page_in(&leaf, WalkFlags::NO_GEN | WalkFlags::WONT_NEED).unwrap());
        assert_eq!(leaf.read_gen(), READ_GEN_OLDEST);
    }

    #[test]
    fn test_walk_visits_leaves_then_root() {
        let (tree, _dir) = tree_with(1024);
        for k in 0..64u64 {
            tree.put(k, vec![0u8; 100]).unwrap();
        }
        assert!(tree.evict_leaf(0).unwrap());
        let leaves = tree.leaves().unwrap().len();

        let mut walk = tree.walk(WalkFlags::empty());
        let mut seen = Vec::new();
        while let Some(handle) = walk.next().unwrap() {
            seen.push(handle.is_root());
        }
        assert_eq!(seen.len(), leaves + 1);
        assert!(seen[..leaves].iter().all(|&root| !root));
        assert!(seen[leaves]);
    }

    #[test]
    fn test_cache_only_walk_skips_disk_pages() {
        let (tree, _dir) = tree_with(1024);
        for k in 0..64u64 {
            tree.put(k, vec![0u8; 100]).unwrap();
        }
        assert!(tree.evict_leaf(0).unwrap());
        tree.get(0).unwrap();

        let mut walk = tree.walk(WalkFlags::CACHE_ONLY);
        let mut leaves = 0;
        while let Some(handle) = walk.next().unwrap() {
            if !handle.is_root() {
                leaves += 1;
            }
        }
        assert_eq!(leaves, 1);
    }

    #[test]
    fn test_evict_walk_never_queues_twice() {
        let (tree, _dir) = tree_with(1024);
        for k in 0..64u64 {
            tree.put(k, vec![0u8; 100]).unwrap();
        }
        assert!(tree.evict_leaf(0).unwrap());
        for k in 0..64u64 {
            tree.get(k).unwrap();
        }
        let resident = tree.leaves().unwrap().len();

        let first = tree.evict_walk(1000, false, false);
        assert_eq!(first.len(), resident);
        let second = tree.evict_walk(1000, false, false);
        assert!(second.is_empty());

        for (leaf, _) in &first {
            leaf.clear_queued();
        }
        assert_eq!(tree.evict_walk(1000, true, false).len(), resident);
    }

    #[test]
    fn test_discard_releases_cache_bytes() {
        let (tree, _dir) = tree_with(32 * 1024);
        for k in 0..10u64 {
            tree.put(k, vec![1u8; 64]).unwrap();
        }
        assert!(tree.cache().bytes_inmem() > 0);

        tree.discard();
        assert!(tree.is_dead());
        assert_eq!(tree.cache().bytes_inmem(), 0);
        assert_eq!(tree.cache().bytes_dirty(), 0);
        assert!(matches!(tree.get(1), Err(Error::TreeNotFound(_))));
    }

    #[test]
    fn test_dead_tree_pages_are_not_read_back() {
        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(1, "x").unwrap();
        assert!(tree.evict_leaf(1).unwrap());
        let leaf = tree.child_for(1).unwrap();
        assert_eq!(leaf.state(), RefState::Disk);

        tree.discard();
        assert_eq!(tree.cache().bytes_inmem(), 0);

        // A reader that got past the open check before the discard.
        assert!(matches!(
            tree.read_page(&leaf, WalkFlags::empty()),
            Err(Error::TreeNotFound(_))
        ));
        assert!(matches!(
            tree.page_in(&leaf, WalkFlags::empty()),
            Err(Error::TreeNotFound(_))
        ));
        assert_eq!(leaf.state(), RefState::Disk);
        assert_eq!(tree.cache().bytes_inmem(), 0);
        assert_eq!(tree.cache().pages_inmem(), 0);
    }

    #[test]
    fn test_reconciled_page_reports_current_address() {
        use crate::btree::reconcile::reconcile;
        use crate::btree::RecResult;

        let (tree, _dir) = tree_with(32 * 1024);
        tree.put(1, "one").unwrap();
        assert!(tree.evict_leaf(1).unwrap());
        let leaf = tree.child_for(1).unwrap();
        let first = leaf.read_info().addr.unwrap();

        tree.put(1, "uno").unwrap();
        let page = leaf.page().unwrap();
        assert!(reconcile(&tree, &leaf, &page).unwrap());
        let info = leaf.read_info();
        assert_eq!(info.state, RefState::Mem);
        let current = info.addr.unwrap();
        assert_ne!(current, first);
        assert_eq!(
            page.modify().unwrap().lock().rec_result,
            RecResult::Replace(current)
        );

        // The replaced block is freed exactly once.
        tree.put(1, "eins").unwrap();
        assert!(reconcile(&tree, &leaf, &page).unwrap());
        let latest = leaf.read_info().addr.unwrap();
        assert_ne!(latest, current);

        assert!(tree.evict_leaf(1).unwrap());
        assert_eq!(leaf.read_info().addr, Some(latest));
        assert_eq!(leaf.state(), RefState::Disk);
        assert_eq!(tree.get(1).unwrap(), Some(b"eins".to_vec()));
    }
}
