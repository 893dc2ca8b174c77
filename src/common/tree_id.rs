//! Tree identifier type.

use std::fmt;

/// Identifies an open tree within a connection.
///
/// Derived from a hash of the tree name, so the same name always maps to the
/// same id and the connection can key its tree map on it directly.
///
/// # Example
/// ```
/// use archengine::TreeId;
///
/// assert_eq!(TreeId::from_name("orders"), TreeId::from_name("orders"));
/// assert_ne!(TreeId::from_name("orders"), TreeId::from_name("users"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u64);

impl TreeId {
    /// Create a new TreeId.
    #[inline]
    pub fn new(id: u64) -> Self {
        TreeId(id)
    }

    /// FNV-1a hash of the tree name.
    pub fn from_name(name: &str) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in name.bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        TreeId(hash)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree({:016x})", self.0)
    }
}
