//! B-tree layer - pages, references and the structures that move them
//! between memory and disk.
//!
//! - [`PageRef`] - a page's slot in its parent and its state machine
//! - [`Page`] / [`PageModify`] - resident pages and their dirty tracking
//! - [`PageHandle`] - RAII pin on a resident page
//! - [`Tree`] / [`TreeWalk`] - the keyed tree and its post-order walk
//! - reconciliation - writing dirty leaves to blocks

mod handle;
mod modify;
mod page;
mod page_ref;
pub(crate) mod reconcile;
mod tree;
mod walk;

pub use handle::PageHandle;
pub use modify::{ModifyState, MultiBlockEntry, PageModify, RecResult};
pub use page::{
    Page, PageKind, CHILD_OVERHEAD, IMAGE_HEADER, IMAGE_ROW_HEADER, PAGE_OVERHEAD, ROW_OVERHEAD,
};
pub use page_ref::{PageRef, RefInfo, RefState, READ_GEN_OLDEST, REF_EVICT_QUEUED};
pub use tree::Tree;
pub use walk::{TreeWalk, WalkFlags};
