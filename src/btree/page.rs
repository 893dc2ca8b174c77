//! In-memory pages and their disk image.
//!
//! A [`Page`] is either a leaf holding rows or an internal page holding the
//! child [`PageRef`]s. Every page tracks its memory footprint; every change
//! to the footprint is mirrored into the owning [`Cache`] so the cache's byte
//! counters always equal the sum over resident pages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::btree::{PageModify, PageRef};
use crate::cache::Cache;
use crate::common::{Error, Result};
use crate::sync::RwSpinLock;

/// Fixed cost charged for every resident page.
pub const PAGE_OVERHEAD: usize = 128;
/// Per-row cost on top of the value bytes.
pub const ROW_OVERHEAD: usize = 32;
/// Per-child cost of an internal page.
pub const CHILD_OVERHEAD: usize = 64;

/// Bytes a row takes in the disk image: key, length, value.
pub const IMAGE_ROW_HEADER: usize = 12;
/// Bytes before the first row in the disk image: row count.
pub const IMAGE_HEADER: usize = 4;

/// Type of a page.
///
/// Uses `#[repr(u8)]` so the value can sit in an atomic or on disk.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Internal = 1,
    Leaf = 2,
}

enum PageContent {
    Leaf(RwLock<BTreeMap<u64, Vec<u8>>>),
    Internal(RwSpinLock<Vec<Arc<PageRef>>>),
}

/// A resident page.
///
/// # Thread Safety
/// - leaf rows: `parking_lot::RwLock`; writers also bump the modify record
///   while holding it, so reconciliation (a reader) sees rows and generation
///   consistently
/// - internal children: `RwSpinLock`; splits replace entries under the
///   write side
/// - footprint: atomic, updated under the content lock
pub struct Page {
    kind: PageKind,
    content: PageContent,
    footprint: AtomicUsize,
    overflow: AtomicUsize,
    overflow_threshold: usize,
    modify: OnceLock<PageModify>,
}

#[inline]
fn row_footprint(value: &[u8]) -> usize {
    ROW_OVERHEAD + value.len()
}

impl Page {
    /// Build a leaf page from rows.
    pub fn new_leaf(rows: BTreeMap<u64, Vec<u8>>, overflow_threshold: usize) -> Self {
        let footprint = PAGE_OVERHEAD + rows.values().map(|v| row_footprint(v)).sum::<usize>();
        let overflow = rows
            .values()
            .filter(|v| v.len() >= overflow_threshold)
            .map(Vec::len)
            .sum();
        Self {
            kind: PageKind::Leaf,
            content: PageContent::Leaf(RwLock::new(rows)),
            footprint: AtomicUsize::new(footprint),
            overflow: AtomicUsize::new(overflow),
            overflow_threshold,
            modify: OnceLock::new(),
        }
    }

    /// Build an internal page over `children`.
    pub fn new_internal(children: Vec<Arc<PageRef>>) -> Self {
        let footprint = PAGE_OVERHEAD + children.len() * CHILD_OVERHEAD;
        Self {
            kind: PageKind::Internal,
            content: PageContent::Internal(RwSpinLock::new(children)),
            footprint: AtomicUsize::new(footprint),
            overflow: AtomicUsize::new(0),
            overflow_threshold: usize::MAX,
            modify: OnceLock::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.kind == PageKind::Internal
    }

    /// Bytes this page is charged in the cache.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.footprint.load(Ordering::Acquire)
    }

    /// Bytes of values at or above the overflow threshold.
    #[inline]
    pub fn overflow_bytes(&self) -> usize {
        self.overflow.load(Ordering::Acquire)
    }

    /// Leaf rows, `None` for internal pages.
    pub fn rows(&self) -> Option<&RwLock<BTreeMap<u64, Vec<u8>>>> {
        match &self.content {
            PageContent::Leaf(rows) => Some(rows),
            PageContent::Internal(_) => None,
        }
    }

    /// Child references, `None` for leaf pages.
    pub fn children(&self) -> Option<&RwSpinLock<Vec<Arc<PageRef>>>> {
        match &self.content {
            PageContent::Internal(children) => Some(children),
            PageContent::Leaf(_) => None,
        }
    }

    /// The modify record, if the page was ever modified.
    #[inline]
    pub fn modify(&self) -> Option<&PageModify> {
        self.modify.get()
    }

    /// The modify record, created on first use.
    #[inline]
    pub fn modify_or_init(&self) -> &PageModify {
        self.modify.get_or_init(PageModify::new)
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.modify().is_some_and(PageModify::is_modified)
    }

    // ========================================================================
    // Row access
    // ========================================================================

    pub fn get(&self, key: u64) -> Option<Vec<u8>> {
        self.rows()?.read().get(&key).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows().map_or(0, |rows| rows.read().len())
    }

    /// Insert or replace a row and mark the page dirty.
    pub fn put(&self, cache: &Cache, key: u64, value: Vec<u8>) -> Result<()> {
        let rows = self.rows().ok_or(Error::PageNotFound)?;
        let mut rows = rows.write();

        let mut delta = row_footprint(&value) as i64;
        let mut ovfl_delta = self.overflow_len(&value) as i64;
        if let Some(old) = rows.insert(key, value) {
            delta -= row_footprint(&old) as i64;
            ovfl_delta -= self.overflow_len(&old) as i64;
        }

        self.account(cache, delta, ovfl_delta);
        self.mark_dirty_locked(cache, delta);
        Ok(())
    }

    /// Remove a row. Returns whether it existed; the page is only dirtied
    /// if it did.
    pub fn remove(&self, cache: &Cache, key: u64) -> Result<bool> {
        let rows = self.rows().ok_or(Error::PageNotFound)?;
        let mut rows = rows.write();

        let Some(old) = rows.remove(&key) else {
            return Ok(false);
        };
        let delta = -(row_footprint(&old) as i64);
        let ovfl_delta = -(self.overflow_len(&old) as i64);

        self.account(cache, delta, ovfl_delta);
        self.mark_dirty_locked(cache, delta);
        Ok(true)
    }

    /// Mark the page dirty without changing its rows.
    pub fn mark_dirty(&self, cache: &Cache) {
        match &self.content {
            PageContent::Leaf(rows) => {
                let _rows = rows.write();
                self.mark_dirty_locked(cache, 0);
            }
            PageContent::Internal(_) => self.mark_dirty_locked(cache, 0),
        }
    }

    fn overflow_len(&self, value: &[u8]) -> usize {
        if value.len() >= self.overflow_threshold {
            value.len()
        } else {
            0
        }
    }

    fn account(&self, cache: &Cache, delta: i64, ovfl_delta: i64) {
        adjust(&self.footprint, delta);
        adjust(&self.overflow, ovfl_delta);
        cache.bytes_adjust(delta, ovfl_delta, self.is_internal());
    }

    /// Caller holds the content write lock.
    fn mark_dirty_locked(&self, cache: &Cache, delta: i64) {
        let modify = self.modify_or_init();
        modify.bump_write_gen();
        if modify.swap_dirty_accounted(true) {
            cache.dirty_adjust(delta);
        } else {
            cache.dirty_incr(self.footprint() as u64);
        }
    }

    /// Clear dirty accounting after a clean reconciliation.
    ///
    /// Caller holds the content read lock, so no writer can re-dirty the
    /// page between the generation check and the flag swap.
    pub(crate) fn clear_dirty_locked(&self, cache: &Cache, written_gen: u64) {
        let Some(modify) = self.modify() else {
            return;
        };
        modify.set_disk_gen(written_gen);
        if modify.write_gen() == written_gen && modify.swap_dirty_accounted(false) {
            cache.dirty_decr(self.footprint() as u64);
        }
    }

    // ========================================================================
    // Internal pages
    // ========================================================================

    /// Replace `old` in the child array with `replacements`.
    ///
    /// Returns `false` if `old` is not a child of this page.
    pub(crate) fn replace_child(
        &self,
        cache: &Cache,
        old: &Arc<PageRef>,
        replacements: Vec<Arc<PageRef>>,
    ) -> bool {
        let Some(children) = self.children() else {
            return false;
        };
        let mut children = children.write();
        let Some(pos) = children.iter().position(|c| Arc::ptr_eq(c, old)) else {
            return false;
        };

        let delta = (replacements.len() as i64 - 1) * CHILD_OVERHEAD as i64;
        children.splice(pos..=pos, replacements);
        self.account(cache, delta, 0);
        true
    }

    // ========================================================================
    // Disk image
    // ========================================================================

    /// Serialize rows.
    ///
    /// # Layout
    /// ```text
    /// count: u32
    /// count × { key: u64, len: u32, value: [u8; len] }
    /// ```
    pub fn encode_rows<'a>(rows: impl Iterator<Item = (&'a u64, &'a Vec<u8>)>) -> Vec<u8> {
        let mut out = vec![0u8; IMAGE_HEADER];
        let mut count: u32 = 0;
        for (key, value) in rows {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
            count += 1;
        }
        out[..IMAGE_HEADER].copy_from_slice(&count.to_le_bytes());
        out
    }

    /// Parse an image produced by [`Page::encode_rows`].
    ///
    /// # Errors
    /// Returns `Error::Corrupt` (tagged with `offset`) if the image is
    /// truncated or has trailing bytes.
    pub fn decode_rows(image: &[u8], offset: u64) -> Result<BTreeMap<u64, Vec<u8>>> {
        let corrupt = |reason: &str| Error::Corrupt {
            offset,
            reason: reason.to_string(),
        };

        let mut rows = BTreeMap::new();
        let count = image
            .get(..IMAGE_HEADER)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| corrupt("page image shorter than its header"))?;

        let mut pos = IMAGE_HEADER;
        for _ in 0..count {
            let header = image
                .get(pos..pos + IMAGE_ROW_HEADER)
                .ok_or_else(|| corrupt("truncated row header"))?;
            let mut key = [0u8; 8];
            key.copy_from_slice(&header[..8]);
            let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
            pos += IMAGE_ROW_HEADER;

            let value = image
                .get(pos..pos + len)
                .ok_or_else(|| corrupt("truncated row value"))?;
            rows.insert(u64::from_le_bytes(key), value.to_vec());
            pos += len;
        }

        if pos != image.len() {
            return Err(corrupt("trailing bytes after last row"));
        }
        Ok(rows)
    }
}

fn adjust(counter: &AtomicUsize, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as usize, Ordering::AcqRel);
    } else {
        counter.fetch_sub(delta.unsigned_abs() as usize, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("kind", &self.kind)
            .field("footprint", &self.footprint())
            .field("modify", &self.modify())
            .finish()
    }
}
