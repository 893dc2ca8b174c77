//! Error types for archengine.

use thiserror::Error;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors surfaced by the engine core.
///
/// Transient conditions (a lost state CAS, a page another thread holds) are
/// handled where they occur and never reach callers, with the single
/// exception of [`Error::Busy`] returned by an individual eviction attempt.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from block reads, writes or file resizing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cache is over its trigger and eviction made no progress.
    ///
    /// Distinct from every other error so callers can back off and retry the
    /// operation that needed memory.
    #[error("cache full: eviction made no progress after {attempts} attempts")]
    CacheFull { attempts: u32 },

    /// The page is in use or otherwise cannot be evicted right now.
    #[error("page busy")]
    Busy,

    /// A Ref pointed at a page that no longer exists (deleted or split).
    #[error("page not found")]
    PageNotFound,

    /// No tree with this name is open in the connection.
    #[error("tree not found: {0}")]
    TreeNotFound(String),

    /// A tree with this name already exists.
    #[error("tree already exists: {0}")]
    TreeExists(String),

    /// A block failed its checksum or header validation.
    #[error("corrupt block at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// An address cookie could not be decoded.
    #[error("invalid block address cookie ({len} bytes)")]
    InvalidAddress { len: usize },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The connection was closed underneath the caller.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// True when the error reports memory pressure rather than a failure.
    pub fn is_cache_full(&self) -> bool {
        matches!(self, Error::CacheFull { .. })
    }

    /// True for the transient "try something else" condition.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

/// Report a broken internal invariant and abort the process.
///
/// Continuing after a page is found in an impossible state risks silent
/// corruption, so this never unwinds.
#[cold]
pub fn fatal(what: &str) -> ! {
    tracing::error!(invariant = what, "internal invariant violated, aborting");
    std::process::abort()
}
