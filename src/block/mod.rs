//! Block layer - on-disk space management for tree files.
//!
//! This module handles where page images live:
//! - [`BlockManager`] - the interface the cache and compaction consume
//! - [`FileBlockManager`] - extent-allocating implementation over one file
//! - [`BlockHeader`] - per-block header with a CRC32 checksum

mod extent;
mod file;
mod header;

pub use extent::ExtentList;
pub use file::FileBlockManager;
pub use header::BlockHeader;

use crate::common::{BlockAddr, Result};

/// Space management for one tree file.
///
/// Reconciliation writes and frees blocks through this trait, page reads go
/// through [`read`](BlockManager::read), and the compaction driver asks it
/// which blocks are worth moving.
pub trait BlockManager: Send + Sync {
    /// Write `payload` to a newly allocated block and return its address.
    fn write(&self, payload: &[u8]) -> Result<BlockAddr>;

    /// Read and verify the block at `addr`, returning its payload.
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>>;

    /// Return the block at `addr` to free space.
    fn free(&self, addr: &BlockAddr) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self) -> u64;

    /// Flush written blocks to stable storage.
    fn sync(&self) -> Result<()>;

    /// A compaction call on this file is starting.
    fn compact_start(&self) -> Result<()>;

    /// The compaction call has finished.
    fn compact_end(&self) -> Result<()>;

    /// Whether compacting the file now would be pointless.
    ///
    /// Also fixes the region of the file the following
    /// [`compact_page_skip`](BlockManager::compact_page_skip) calls target.
    fn compact_skip(&self) -> Result<bool>;

    /// Whether the block at `addr` should stay where it is.
    fn compact_page_skip(&self, addr: &BlockAddr) -> Result<bool>;

    /// Human-readable form of an address, for logs.
    fn addr_string(&self, addr: &BlockAddr) -> String;
}
