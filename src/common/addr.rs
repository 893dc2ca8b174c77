//! On-disk block address.

use std::fmt;

use crate::common::{Error, Result};

/// Where a page image lives in its tree's file.
///
/// The rest of the engine treats the address as an opaque cookie: the tree
/// stores [`BlockAddr::to_cookie`] bytes and only the block manager looks
/// inside them.
///
/// # Cookie layout (16 bytes, little-endian)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     offset (byte offset in file)
/// 8       4     size (bytes on disk, multiple of the allocation unit)
/// 12      4     checksum (CRC32 of the block)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockAddr {
    pub offset: u64,
    pub size: u32,
    pub checksum: u32,
}

impl BlockAddr {
    /// Size of an encoded cookie.
    pub const COOKIE_SIZE: usize = 16;

    /// Create a new address.
    #[inline]
    pub fn new(offset: u64, size: u32, checksum: u32) -> Self {
        Self {
            offset,
            size,
            checksum,
        }
    }

    /// First byte past the block.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.size)
    }

    /// Encode as an opaque cookie.
    pub fn to_cookie(&self) -> [u8; Self::COOKIE_SIZE] {
        let mut buf = [0u8; Self::COOKIE_SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode a cookie produced by [`BlockAddr::to_cookie`].
    ///
    /// # Errors
    /// Returns `Error::InvalidAddress` if the cookie has the wrong length.
    pub fn from_cookie(cookie: &[u8]) -> Result<Self> {
        if cookie.len() != Self::COOKIE_SIZE {
            return Err(Error::InvalidAddress { len: cookie.len() });
        }
        let mut offset = [0u8; 8];
        let mut size = [0u8; 4];
        let mut checksum = [0u8; 4];
        offset.copy_from_slice(&cookie[0..8]);
        size.copy_from_slice(&cookie[8..12]);
        checksum.copy_from_slice(&cookie[12..16]);
        Ok(Self {
            offset: u64::from_le_bytes(offset),
            size: u32::from_le_bytes(size),
            checksum: u32::from_le_bytes(checksum),
        })
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}-{}, {}, {:#010x}]",
            self.offset,
            self.end(),
            self.size,
            self.checksum
        )
    }
}
