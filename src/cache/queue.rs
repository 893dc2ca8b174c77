//! Eviction candidate queue.

use std::sync::Arc;

use crate::btree::{PageRef, Tree};
use crate::common::TreeId;
use crate::sync::Spinlock;

/// A page the eviction walk considered worth evicting.
pub struct Candidate {
    pub tree: Arc<Tree>,
    pub page_ref: Arc<PageRef>,
    /// Lower is evicted first.
    pub score: u64,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("tree", &self.tree.name())
            .field("start_key", &self.page_ref.start_key())
            .field("score", &self.score)
            .finish()
    }
}

struct QueueInner {
    /// Sorted by score; slots before `current` have been handed out.
    entries: Vec<Option<Candidate>>,
    current: usize,
}

/// Bounded, score-ordered queue of eviction candidates.
///
/// A Ref enters the queue only after claiming its queued flag, and the flag
/// is cleared whenever the entry leaves (popped, trimmed or purged), so a
/// Ref is never queued twice.
///
/// # Thread Safety
/// Protected by its own spinlock, separate from the walk position, so
/// threads evicting from the queue don't wait on a thread refilling it.
pub struct EvictQueue {
    slots: usize,
    inner: Spinlock<QueueInner>,
}

impl EvictQueue {
    /// Create a queue holding at most `slots` candidates.
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            inner: Spinlock::new(
                "evict queue",
                QueueInner {
                    entries: Vec::with_capacity(slots),
                    current: 0,
                },
            ),
        }
    }

    /// Merge `batch` with the unconsumed entries, re-sort, and trim to the
    /// slot count. Returns the number of entries now queued.
    pub fn push_batch(&self, batch: Vec<Candidate>) -> usize {
        if batch.is_empty() {
            return self.len();
        }

        let mut dropped = Vec::new();
        let len = {
            let mut inner = self.inner.lock();
            let mut live: Vec<Candidate> = inner.entries.drain(..).flatten().collect();
            live.extend(batch);
            live.sort_by_key(|c| c.score);
            if live.len() > self.slots {
                dropped = live.split_off(self.slots);
            }
            inner.entries = live.into_iter().map(Some).collect();
            inner.current = 0;
            inner.entries.len()
        };

        for c in dropped {
            c.page_ref.clear_queued();
        }
        len
    }

    /// Take the best remaining candidate.
    pub fn pop(&self) -> Option<Candidate> {
        let candidate = {
            let mut inner = self.inner.lock();
            let mut found = None;
            while inner.current < inner.entries.len() {
                let i = inner.current;
                inner.current += 1;
                if let Some(c) = inner.entries[i].take() {
                    found = Some(c);
                    break;
                }
            }
            found
        }?;
        candidate.page_ref.clear_queued();
        Some(candidate)
    }

    /// Remove every entry for `tree`.
    pub fn purge(&self, tree: TreeId) -> usize {
        self.remove_where(|c| c.tree.id() == tree)
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, pred: impl Fn(&Candidate) -> bool) -> usize {
        let removed: Vec<Candidate> = {
            let mut inner = self.inner.lock();
            let start = inner.current;
            let mut removed = Vec::new();
            for slot in inner.entries[start..].iter_mut() {
                if slot.as_ref().is_some_and(&pred) {
                    removed.extend(slot.take());
                }
            }
            removed
        };
        for c in &removed {
            c.page_ref.clear_queued();
        }
        removed.len()
    }

    /// Candidates not yet handed out.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries[inner.current..]
            .iter()
            .filter(|c| c.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}
