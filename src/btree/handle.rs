//! RAII handle for resident pages.

use std::ops::Deref;
use std::sync::Arc;

use crate::btree::{Page, PageRef};

/// A pinned, resident page.
///
/// While a handle exists the page holds a hazard reference and cannot be
/// evicted. Dropping the handle releases it.
///
/// # Example
/// ```ignore
/// let handle = tree.page_in(&child, WalkFlags::empty())?;
/// let value = handle.get(key);
/// // handle drops here, hazard released
/// ```
pub struct PageHandle {
    page_ref: Arc<PageRef>,
    page: Arc<Page>,
}

impl PageHandle {
    /// Wrap a Ref whose hazard the caller already acquired.
    pub(crate) fn new(page_ref: Arc<PageRef>, page: Arc<Page>) -> Self {
        Self { page_ref, page }
    }

    #[inline]
    pub fn page_ref(&self) -> &Arc<PageRef> {
        &self.page_ref
    }

    #[inline]
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.page_ref.is_root()
    }
}

impl Deref for PageHandle {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.page_ref.hazard_release();
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_ref", &self.page_ref)
            .finish()
    }
}
