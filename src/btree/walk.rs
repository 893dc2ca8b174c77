//! Tree walk.

use std::ops::BitOr;

use crate::btree::{PageHandle, PageRef, RefState, Tree};
use crate::common::{Error, Result};

/// Options for a tree walk and for page reads in general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkFlags(u32);

impl WalkFlags {
    /// Don't publish a new read generation for pages visited.
    pub const NO_GEN: Self = Self(0x01);
    /// Before reading an on-disk leaf, ask the block manager whether
    /// compaction wants it; skip it if not.
    pub const COMPACT: Self = Self(0x02);
    /// Pages read in get the oldest read generation.
    pub const WONT_NEED: Self = Self(0x04);
    /// Only visit pages already resident.
    pub const CACHE_ONLY: Self = Self(0x08);

    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WalkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

enum Visit {
    Page(PageHandle),
    Skip,
    Restart,
}

/// Post-order walk over a tree: every leaf in key order, then the root.
///
/// Each call to [`next`](TreeWalk::next) returns a pinned page; the previous
/// one should be dropped first. The walk tracks its position by key, so
/// splits that happen underneath it cost at most a revisit.
pub struct TreeWalk<'a> {
    tree: &'a Tree,
    flags: WalkFlags,
    /// Start key of the next leaf to visit; `None` once leaves are done.
    next_key: Option<u64>,
    root_done: bool,
}

impl<'a> TreeWalk<'a> {
    pub fn new(tree: &'a Tree, flags: WalkFlags) -> Self {
        Self {
            tree,
            flags,
            next_key: Some(0),
            root_done: false,
        }
    }

    /// The next page, or `None` when the walk is complete.
    pub fn next(&mut self) -> Result<Option<PageHandle>> {
        while let Some(key) = self.next_key {
            let Some(child) = self.tree.child_at_or_after(key)? else {
                self.next_key = None;
                break;
            };
            self.next_key = child.start_key().checked_add(1);

            match self.visit(&child)? {
                Visit::Page(handle) => return Ok(Some(handle)),
                Visit::Skip => {}
                Visit::Restart => self.next_key = Some(child.start_key()),
            }
        }

        if self.root_done {
            return Ok(None);
        }
        self.root_done = true;
        Ok(self.tree.page_if_resident(self.tree.root(), self.flags))
    }

    fn visit(&self, child: &std::sync::Arc<PageRef>) -> Result<Visit> {
        if self.flags.contains(WalkFlags::CACHE_ONLY) {
            return Ok(match self.tree.page_if_resident(child, self.flags) {
                Some(handle) => Visit::Page(handle),
                None if child.state() == RefState::Split => Visit::Restart,
                None => Visit::Skip,
            });
        }

        if self.flags.contains(WalkFlags::COMPACT) {
            match child.state() {
                RefState::Deleted => return Ok(Visit::Skip),
                RefState::Disk => {
                    if let Some(addr) = child.addr() {
                        if self.tree.block_manager().compact_page_skip(&addr)? {
                            return Ok(Visit::Skip);
                        }
                    }
                }
                _ => {}
            }
        }

        match self.tree.page_in(child, self.flags) {
            Ok(handle) => Ok(Visit::Page(handle)),
            Err(Error::PageNotFound) => Ok(Visit::Restart),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_compose() {
        let flags = WalkFlags::NO_GEN | WalkFlags::COMPACT | WalkFlags::WONT_NEED;
        assert!(flags.contains(WalkFlags::NO_GEN));
        assert!(flags.contains(WalkFlags::COMPACT | WalkFlags::WONT_NEED));
        assert!(!flags.contains(WalkFlags::CACHE_ONLY));
        assert!(WalkFlags::empty().contains(WalkFlags::empty()));
    }
}
