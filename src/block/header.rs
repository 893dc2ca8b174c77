//! Block header and checksum.
//!
//! Every block written by the [`FileBlockManager`](super::FileBlockManager)
//! starts with a [`BlockHeader`]:
//! - magic number identifying an engine block
//! - CRC32 checksum for integrity
//! - payload length, since blocks are padded to the allocation unit

use crate::common::{Error, Result};

/// Metadata stored at the beginning of every block.
///
/// # Layout (16 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic (little-endian)
/// 4       4     checksum (CRC32, little-endian)
/// 8       4     payload_len (little-endian)
/// 12      4     reserved (zero)
/// ```
///
/// # Checksum
/// The checksum covers the whole padded block with the checksum field itself
/// set to zero, so verification needs no special handling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub checksum: u32,
    pub payload_len: u32,
}

impl BlockHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 16;

    /// Marks a block as ours.
    pub const MAGIC: u32 = 0x4152_4342;

    pub const OFFSET_MAGIC: usize = 0;
    pub const OFFSET_CHECKSUM: usize = 4;
    pub const OFFSET_PAYLOAD_LEN: usize = 8;

    /// Create a header for a payload of `payload_len` bytes.
    ///
    /// The checksum is filled in by [`BlockHeader::seal`].
    pub fn new(payload_len: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            checksum: 0,
            payload_len,
        }
    }

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < BlockHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for BlockHeader");

        Self {
            magic: read_u32(data, Self::OFFSET_MAGIC),
            checksum: read_u32(data, Self::OFFSET_CHECKSUM),
            payload_len: read_u32(data, Self::OFFSET_PAYLOAD_LEN),
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < BlockHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for BlockHeader");

        data[Self::OFFSET_MAGIC..Self::OFFSET_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
        data[Self::OFFSET_PAYLOAD_LEN..Self::OFFSET_PAYLOAD_LEN + 4]
            .copy_from_slice(&self.payload_len.to_le_bytes());
        data[12..Self::SIZE].fill(0);
    }

    /// Compute the CRC32 of a whole block, treating the checksum field as
    /// zero.
    pub fn compute_checksum(block: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&block[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Fill in the checksum of a block whose header is already written.
    /// Returns the checksum.
    pub fn seal(block: &mut [u8]) -> u32 {
        let checksum = Self::compute_checksum(block);
        block[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_le_bytes());
        checksum
    }

    /// Validate a block read from `offset` against the checksum its address
    /// recorded, returning the header.
    ///
    /// # Errors
    /// Returns `Error::Corrupt` on a bad magic, checksum or length.
    pub fn verify(block: &[u8], offset: u64, expected: u32) -> Result<Self> {
        if block.len() < Self::SIZE {
            return Err(corrupt(offset, "block shorter than header"));
        }
        let header = Self::from_bytes(block);
        if header.magic != Self::MAGIC {
            return Err(corrupt(offset, "bad magic"));
        }
        if header.checksum != expected {
            return Err(corrupt(offset, "checksum does not match address"));
        }
        if Self::compute_checksum(block) != header.checksum {
            return Err(corrupt(offset, "checksum mismatch"));
        }
        if Self::SIZE + header.payload_len as usize > block.len() {
            return Err(corrupt(offset, "payload length exceeds block"));
        }
        Ok(header)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn corrupt(offset: u64, reason: &str) -> Error {
    Error::Corrupt {
        offset,
        reason: reason.to_string(),
    }
}
