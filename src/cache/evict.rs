//! Eviction: choosing victims and writing them out.
//!
//! Candidates are gathered by walking trees from a persistent position,
//! scored by read generation, and merged into the shared [`EvictQueue`].
//! Eviction workers and application threads both pull victims from the
//! queue; whoever wins a victim's Ref state CAS evicts it.
//!
//! [`EvictQueue`]: crate::cache::EvictQueue

use std::sync::Arc;

use crate::btree::reconcile::reconcile;
use crate::btree::{PageRef, RecResult, RefState, Tree};
use crate::cache::{
    Cache, Candidate, Stat, EVICT_AGGRESSIVE, EVICT_ALL, EVICT_DIRTY, EVICT_STUCK,
    EVICT_WALK_REVERSE,
};
use crate::common::{fatal, Error, Result};

/// Queue fills a single pass may do before giving up on reaching the target.
const MAX_FILLS_PER_PASS: usize = 10;

/// What a successful [`Cache::evict_page`] did with the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The page left the cache.
    Evicted,
    /// A dirty-only pass wrote the page; it stays resident and clean.
    WrittenBack,
}

impl Cache {
    /// Walk `tree` for up to `max` candidates and merge them into the queue.
    ///
    /// Never blocks: a tree being discarded yields nothing. Returns the
    /// number of candidates found.
    pub fn insert_candidates(&self, tree: &Arc<Tree>, max: usize) -> usize {
        if tree.is_dead() {
            return 0;
        }
        let reverse = self.flags.contains(EVICT_WALK_REVERSE);
        let found = tree.evict_walk(max, reverse, self.dirty_only());
        let n = found.len();
        if n == 0 {
            return 0;
        }

        let batch = found
            .into_iter()
            .map(|(page_ref, score)| Candidate {
                tree: Arc::clone(tree),
                page_ref,
                score,
            })
            .collect();
        self.queue.push_batch(batch);
        self.stats().add(Stat::EvictQueued, n as u64);
        n
    }

    /// Refill the queue from the next tree in rotation, or from every tree
    /// when the previous pass got stuck.
    ///
    /// Only one thread fills at a time; others return 0 immediately.
    pub(crate) fn fill_queue(&self) -> usize {
        let Some(mut pos) = self.walk_tree.try_lock() else {
            return 0;
        };
        let trees = self.trees();
        if trees.is_empty() {
            return 0;
        }

        let config = self.eviction_config();
        let walk_all = self.flags.intersects(EVICT_ALL | EVICT_STUCK);
        let n = trees.len();
        let mut queued = 0;
        for i in 0..n {
            let tree = &trees[(*pos + i) % n];
            queued += self.insert_candidates(tree, config.walk_per_file);
            if queued >= self.queue.slots() || (!walk_all && queued > 0) {
                *pos = (*pos + i + 1) % n;
                return queued;
            }
        }
        *pos = (*pos + 1) % n;
        queued
    }

    /// Pop candidates until one can be locked for eviction.
    ///
    /// Candidates whose tree is gone, or whose Ref another thread moved out
    /// of `Mem`, are dropped.
    pub fn select_victim(&self) -> Option<Candidate> {
        while let Some(candidate) = self.queue.pop() {
            if candidate.tree.is_dead() {
                continue;
            }
            if candidate.page_ref.try_lock_for_evict() {
                return Some(candidate);
            }
        }
        None
    }

    /// Evict a page whose Ref the caller has already moved to `Locked`.
    ///
    /// On success the Ref ends in `Disk`, `Deleted` or `Split`, or, when a
    /// dirty-only pass only wrote the page, back in `Mem` and clean. On
    /// failure it is put back to `Mem`.
    ///
    /// # Errors
    /// `Error::Busy` if the page is pinned, has resident children, or is
    /// clean during a dirty-only pass. I/O errors from reconciliation.
    pub fn evict_page(&self, tree: &Tree, page_ref: &Arc<PageRef>) -> Result<EvictOutcome> {
        match self.evict_locked(tree, page_ref) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if page_ref.state() == RefState::Locked {
                    page_ref.set_state(RefState::Mem);
                }
                if e.is_busy() {
                    self.stats().incr(Stat::EvictBusy);
                } else {
                    self.stats().incr(Stat::EvictFail);
                    tracing::warn!(
                        tree = tree.name(),
                        start_key = page_ref.start_key(),
                        error = %e,
                        "page eviction failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn evict_locked(&self, tree: &Tree, page_ref: &Arc<PageRef>) -> Result<EvictOutcome> {
        if page_ref.state() != RefState::Locked {
            fatal("evicting a Ref that is not locked");
        }
        if page_ref.is_root() {
            return Err(Error::Busy);
        }
        if page_ref.hazards() > 0 {
            self.stats().incr(Stat::EvictHazard);
            return Err(Error::Busy);
        }
        let Some(page) = page_ref.page() else {
            fatal("locked Ref without a page");
        };

        if tree.is_dead() {
            self.discard_page(page_ref, RefState::Deleted);
            return Ok(EvictOutcome::Evicted);
        }

        if let Some(children) = page.children() {
            let resident = children
                .read()
                .iter()
                .any(|c| !matches!(c.state(), RefState::Disk | RefState::Deleted));
            if resident {
                return Err(Error::Busy);
            }
        }

        let dirty_only = self.dirty_only();
        let was_modified = page.is_modified();
        if !was_modified && dirty_only {
            return Err(Error::Busy);
        }
        if was_modified {
            reconcile(tree, page_ref, &page)?;
        }

        let result = page
            .modify()
            .map(|m| m.lock().rec_result.clone())
            .unwrap_or_default();
        let footprint = page.footprint() as u64;
        let final_state = match result {
            RecResult::None => match page_ref.addr() {
                Some(_) => RefState::Disk,
                None => RefState::Deleted,
            },
            RecResult::Empty => {
                page_ref.set_addr(None);
                RefState::Deleted
            }
            RecResult::Replace(addr) => {
                // Written and now clean; that is all a dirty-only pass wants.
                if dirty_only {
                    page_ref.set_state(RefState::Mem);
                    self.stats().incr(Stat::EvictWrittenBack);
                    tracing::trace!(
                        tree = tree.name(),
                        start_key = page_ref.start_key(),
                        "page written back"
                    );
                    return Ok(EvictOutcome::WrittenBack);
                }
                page_ref.set_addr(Some(addr));
                RefState::Disk
            }
            RecResult::MultiBlock(blocks) => {
                tree.split(page_ref, &blocks)?;
                RefState::Split
            }
        };

        self.discard_page(page_ref, final_state);

        let stats = self.stats();
        stats.incr(Stat::PagesEvicted);
        stats.add(Stat::BytesEvicted, footprint);
        stats.incr(if was_modified {
            Stat::EvictDirty
        } else {
            Stat::EvictClean
        });
        if page.is_internal() {
            stats.incr(Stat::EvictInternal);
        }
        self.record_evicted(footprint);
        tracing::trace!(
            tree = tree.name(),
            start_key = page_ref.start_key(),
            bytes = footprint,
            state = ?final_state,
            "page evicted"
        );
        Ok(EvictOutcome::Evicted)
    }

    /// Drop the Ref's page from the cache and publish its final state.
    fn discard_page(&self, page_ref: &PageRef, state: RefState) {
        if let Some(page) = page_ref.take_page() {
            self.page_out(&page);
        }
        page_ref.set_state(state);
    }

    /// Dirty bytes are over their trigger but total usage is not.
    fn dirty_only(&self) -> bool {
        self.flags.contains(EVICT_DIRTY) && !self.flags.contains(EVICT_AGGRESSIVE)
    }

    /// One eviction pass: refill the queue and evict until usage drops
    /// below the targets or no victim can be found.
    ///
    /// Returns the number of pages evicted or written back. A pass that
    /// does neither while eviction is still needed marks the cache stuck
    /// and reverses the walk direction for the next pass.
    pub fn evict_pass(&self) -> usize {
        self.stats().incr(Stat::EvictPasses);
        self.update_pressure();

        let mut progress = 0;
        for _ in 0..MAX_FILLS_PER_PASS {
            if !self.needs_eviction() {
                break;
            }
            self.fill_queue();
            let mut found = false;
            while self.needs_eviction() {
                let Some(victim) = self.select_victim() else {
                    self.stats().incr(Stat::EvictQueueEmpty);
                    break;
                };
                found = true;
                if self.evict_page(&victim.tree, &victim.page_ref).is_ok() {
                    progress += 1;
                }
            }
            if !found {
                break;
            }
            self.update_pressure();
        }

        if progress > 0 {
            self.waiter_cond().signal();
        }
        let still_needed = self.update_pressure() || self.needs_eviction();
        if progress == 0 && still_needed {
            if !self.flags.contains(EVICT_STUCK) {
                tracing::debug!(
                    inuse = self.bytes_inuse(),
                    size = self.size(),
                    "eviction pass made no progress"
                );
            }
            self.flags.set(EVICT_STUCK);
            self.toggle_walk_direction();
            self.stats().incr(Stat::EvictStuck);
        } else {
            self.flags.clear(EVICT_STUCK);
        }
        progress
    }

    fn toggle_walk_direction(&self) {
        if self.flags.contains(EVICT_WALK_REVERSE) {
            self.flags.clear(EVICT_WALK_REVERSE);
        } else {
            self.flags.set(EVICT_WALK_REVERSE);
        }
    }

    /// Throttle an application thread while the cache is over its trigger.
    ///
    /// The thread evicts pages itself while it can, and waits for the
    /// eviction workers when it cannot.
    ///
    /// # Errors
    /// `Error::CacheFull` after the configured number of attempts in a row
    /// made no progress.
    pub fn app_eviction_check(&self) -> Result<()> {
        if !self.update_pressure() {
            return Ok(());
        }

        let config = self.eviction_config();
        let mut stalled = 0u32;
        loop {
            if self.evict_one() {
                self.stats().incr(Stat::AppEvicts);
                self.waiter_cond().signal();
                stalled = 0;
            } else {
                self.stats().incr(Stat::AppWaits);
                self.wake_server();
                self.waiter_cond().wait(config.wait_timeout);
                stalled += 1;
            }

            if !self.update_pressure() {
                return Ok(());
            }
            if stalled >= config.app_eviction_attempts {
                self.stats().incr(Stat::CacheFull);
                tracing::warn!(
                    attempts = stalled,
                    inuse = self.bytes_inuse(),
                    size = self.size(),
                    "cache full"
                );
                return Err(Error::CacheFull { attempts: stalled });
            }
        }
    }

    /// Evict or write back a single page from the queue, refilling it if
    /// empty.
    fn evict_one(&self) -> bool {
        let victim = self.select_victim().or_else(|| {
            self.fill_queue();
            self.select_victim()
        });
        match victim {
            Some(v) => self.evict_page(&v.tree, &v.page_ref).is_ok(),
            None => false,
        }
    }
}
