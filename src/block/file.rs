//! File-backed block manager.
//!
//! The [`FileBlockManager`] owns one tree file and handles all direct file
//! operations:
//! - Writing variable-sized blocks at allocated offsets
//! - Reading and verifying blocks
//! - Tracking free space and truncating a free tail
//! - Deciding what compaction should move

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::block::{BlockHeader, BlockManager, ExtentList};
use crate::common::config::BlockConfig;
use crate::common::{BlockAddr, Error, Result};

/// Mutable file state, serialized by one lock.
struct FileState {
    file: File,
    /// Logical end of file.
    size: u64,
    /// Free extents inside `[0, size)`.
    avail: ExtentList,
}

/// Manages block I/O for a single tree file.
///
/// # File Layout
/// Blocks are variable-sized multiples of the allocation unit, placed
/// wherever first-fit allocation finds room:
/// ```text
/// ┌──────────┬────────┬──────────────────┬────────┬──────────┐
/// │ block A  │  free  │     block B      │  free  │ block C  │
/// │ (4KB)    │ (8KB)  │     (12KB)       │ (4KB)  │ (4KB)    │
/// └──────────┴────────┴──────────────────┴────────┴──────────┘
/// ```
/// Freeing the last block shrinks the file.
///
/// # Thread Safety
/// All state sits behind one `Mutex`; I/O happens while it is held.
///
/// # Durability
/// Writes are not synced individually. Checkpoint calls
/// [`BlockManager::sync`] once after writing every dirty page.
pub struct FileBlockManager {
    path: PathBuf,
    alloc_size: u64,
    compact_min_bytes: u64,
    state: Mutex<FileState>,
    /// Tenths of the file compaction is currently targeting (0 = none).
    compact_pct_tenths: AtomicU32,
}

impl FileBlockManager {
    /// Create a new, empty tree file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, config: &BlockConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            alloc_size: config.alloc_size,
            compact_min_bytes: config.compact_min_bytes,
            state: Mutex::new(FileState {
                file,
                size: 0,
                avail: ExtentList::new(),
            }),
            compact_pct_tenths: AtomicU32::new(0),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free bytes inside the file.
    pub fn avail_bytes(&self) -> u64 {
        self.state.lock().avail.bytes()
    }

    fn round_up(&self, len: u64) -> u64 {
        len.div_ceil(self.alloc_size) * self.alloc_size
    }

    fn check_addr(&self, addr: &BlockAddr, file_size: u64) -> Result<()> {
        if addr.size == 0
            || addr.offset % self.alloc_size != 0
            || u64::from(addr.size) % self.alloc_size != 0
            || addr.end() > file_size
        {
            return Err(Error::Corrupt {
                offset: addr.offset,
                reason: format!("address {} outside file of {} bytes", addr, file_size),
            });
        }
        Ok(())
    }
}

impl BlockManager for FileBlockManager {
    fn write(&self, payload: &[u8]) -> Result<BlockAddr> {
        let len = self.round_up((BlockHeader::SIZE + payload.len()) as u64);
        let size = u32::try_from(len).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block of {} bytes is too large", len),
            ))
        })?;

        let mut block = vec![0u8; len as usize];
        BlockHeader::new(payload.len() as u32).write_to(&mut block);
        block[BlockHeader::SIZE..BlockHeader::SIZE + payload.len()].copy_from_slice(payload);
        let checksum = BlockHeader::seal(&mut block);

        let mut st = self.state.lock();
        let (offset, extended) = match st.avail.alloc_first_fit(len) {
            Some(offset) => (offset, false),
            None => (st.size, true),
        };

        let written = st
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| st.file.write_all(&block));
        if let Err(e) = written {
            if !extended {
                st.avail.insert(offset, len);
            }
            return Err(e.into());
        }
        if extended {
            st.size += len;
        }

        let addr = BlockAddr::new(offset, size, checksum);
        tracing::trace!(file = %self.path.display(), %addr, "block written");
        Ok(addr)
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let mut st = self.state.lock();
        self.check_addr(addr, st.size)?;

        let mut block = vec![0u8; addr.size as usize];
        st.file.seek(SeekFrom::Start(addr.offset))?;
        st.file.read_exact(&mut block)?;
        drop(st);

        let header = BlockHeader::verify(&block, addr.offset, addr.checksum)?;
        let start = BlockHeader::SIZE;
        block.truncate(start + header.payload_len as usize);
        block.drain(..start);
        Ok(block)
    }

    fn free(&self, addr: &BlockAddr) -> Result<()> {
        let mut st = self.state.lock();
        self.check_addr(addr, st.size)?;

        if !st.avail.insert(addr.offset, u64::from(addr.size)) {
            return Err(Error::Corrupt {
                offset: addr.offset,
                reason: format!("block {} freed twice", addr),
            });
        }

        let file_size = st.size;
        if let Some(new_end) = st.avail.take_tail(file_size) {
            st.file.set_len(new_end)?;
            st.size = new_end;
            tracing::trace!(
                file = %self.path.display(),
                from = file_size,
                to = new_end,
                "file truncated"
            );
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    fn compact_start(&self) -> Result<()> {
        // Allocation is always first-fit, so the target region chosen by
        // compact_skip is all that needs to carry over.
        tracing::trace!(
            file = %self.path.display(),
            target_tenths = self.compact_pct_tenths.load(Ordering::Relaxed),
            "compaction started"
        );
        Ok(())
    }

    fn compact_end(&self) -> Result<()> {
        self.compact_pct_tenths.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn compact_skip(&self) -> Result<bool> {
        let st = self.state.lock();
        let size = st.size;
        if size <= self.compact_min_bytes {
            return Ok(true);
        }

        let eighty = size - (size / 10) * 2;
        let ninety = size - size / 10;
        let avail_eighty = st.avail.bytes_before(eighty);
        let avail_ninety = st.avail.bytes_before(ninety);

        let tenths = if avail_eighty > self.compact_min_bytes && avail_eighty >= (size / 100) * 20
        {
            2
        } else if avail_ninety > self.compact_min_bytes && avail_ninety >= (size / 100) * 10 {
            1
        } else {
            0
        };
        self.compact_pct_tenths.store(tenths, Ordering::Relaxed);

        tracing::debug!(
            file = %self.path.display(),
            size,
            avail = st.avail.bytes(),
            avail_eighty,
            avail_ninety,
            target_tenths = tenths,
            "compaction skip check"
        );
        Ok(tenths == 0)
    }

    fn compact_page_skip(&self, addr: &BlockAddr) -> Result<bool> {
        let tenths = u64::from(self.compact_pct_tenths.load(Ordering::Relaxed));
        if tenths == 0 {
            return Ok(true);
        }

        let st = self.state.lock();
        let limit = st.size - (st.size / 10) * tenths;
        let rewrite = addr.offset > limit && st.avail.has_fit_before(u64::from(addr.size), limit);
        Ok(!rewrite)
    }

    fn addr_string(&self, addr: &BlockAddr) -> String {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(compact_min_bytes: u64) -> BlockConfig {
        BlockConfig {
            alloc_size: 4096,
            compact_min_bytes,
        }
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tree");

        FileBlockManager::create(&path, &config(0)).unwrap();
        assert!(FileBlockManager::create(&path, &config(0)).is_err());
    }

    #[test]
    fn test_write_and_read_block() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();

        let a = bm.write(b"first block").unwrap();
        let b = bm.write(&vec![7u8; 5000]).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 4096);
        assert_eq!(b.offset, 4096);
        assert_eq!(b.size, 8192);
        assert_eq!(bm.size(), 12288);

        assert_eq!(bm.read(&a).unwrap(), b"first block");
        assert_eq!(bm.read(&b).unwrap(), vec![7u8; 5000]);
    }

    #[test]
    fn test_freed_space_is_reused_first_fit() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();

        let a = bm.write(b"a").unwrap();
        let _b = bm.write(b"b").unwrap();
        bm.free(&a).unwrap();
        assert_eq!(bm.avail_bytes(), 4096);

        let c = bm.write(b"c").unwrap();
        assert_eq!(c.offset, 0);
        assert_eq!(bm.avail_bytes(), 0);
    }

    #[test]
    fn test_freeing_tail_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tree");
        let bm = FileBlockManager::create(&path, &config(0)).unwrap();

        let a = bm.write(b"a").unwrap();
        let b = bm.write(b"b").unwrap();
        let c = bm.write(b"c").unwrap();

        bm.free(&b).unwrap();
        assert_eq!(bm.size(), 12288);
        bm.free(&c).unwrap();
        assert_eq!(bm.size(), 4096);
        assert_eq!(bm.avail_bytes(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        assert_eq!(bm.read(&a).unwrap(), b"a");
    }

    #[test]
    fn test_double_free_rejected() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();

        let a = bm.write(b"a").unwrap();
        let _b = bm.write(b"b").unwrap();
        bm.free(&a).unwrap();
        assert!(matches!(bm.free(&a), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_read_detects_stale_address() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();

        let a = bm.write(b"old").unwrap();
        let _keep = bm.write(b"keep").unwrap();
        bm.free(&a).unwrap();
        let _reused = bm.write(b"new").unwrap();

        assert!(matches!(bm.read(&a), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_read_outside_file_rejected() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();
        let bogus = BlockAddr::new(1 << 20, 4096, 0);
        assert!(bm.read(&bogus).is_err());
    }

    #[test]
    fn test_compact_skip_small_file() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(1 << 20)).unwrap();
        for _ in 0..10 {
            bm.write(b"x").unwrap();
        }
        assert!(bm.compact_skip().unwrap());
    }

    #[test]
    fn test_compact_targets_tail_blocks() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();

        let addrs: Vec<_> = (0..10).map(|_| bm.write(b"x").unwrap()).collect();
        // Free 3 of the first 8 blocks: 30% of the file, all in the first 80%.
        for addr in &addrs[1..4] {
            bm.free(addr).unwrap();
        }

        assert!(!bm.compact_skip().unwrap());
        bm.compact_start().unwrap();

        // The limit is 80% of 40KB = 32KB; blocks at 36KB qualify, 32KB does not.
        assert!(!bm.compact_page_skip(&addrs[9]).unwrap());
        assert!(bm.compact_page_skip(&addrs[8]).unwrap());
        assert!(bm.compact_page_skip(&addrs[0]).unwrap());

        bm.compact_end().unwrap();
        assert!(bm.compact_page_skip(&addrs[9]).unwrap());
    }

    #[test]
    fn test_compact_skip_without_free_space() {
        let dir = tempdir().unwrap();
        let bm = FileBlockManager::create(dir.path().join("t.tree"), &config(0)).unwrap();
        for _ in 0..10 {
            bm.write(b"x").unwrap();
        }
        assert!(bm.compact_skip().unwrap());
    }
}
