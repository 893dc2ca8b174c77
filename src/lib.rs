//! archengine - page cache, eviction and compaction core for an embedded
//! B-tree storage engine.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          archengine                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │          Connection (conn/) + registry of pools          │   │
//! │  │   open / create_tree / checkpoint / compact / close      │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌──────────────────────────┐  ┌───────────────────────────┐   │
//! │  │   Cache (cache/)          │  │  Compaction (compact.rs)  │   │
//! │  │ accounting, pressure,     │  │ skip-check → walk →       │   │
//! │  │ eviction queue + workers, │  │ rewrite-decide → dirty    │   │
//! │  │ shared cache pools        │  │                           │   │
//! │  └──────────────────────────┘  └───────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │        B-tree (btree/): Ref state machine, pages,        │   │
//! │  │        hazard-pinned handles, walk, reconciliation       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │     Block manager (block/): extents, checksummed blocks   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (TreeId, BlockAddr, Error, config)
//! - [`sync`] - Spin, fair and read/write locks, condition variable, flags
//! - [`block`] - Block manager trait and file implementation
//! - [`btree`] - Refs, pages, trees, walks
//! - [`cache`] - Cache accounting, eviction, cache pools, statistics
//! - [`compact`] - Compaction driver
//! - [`conn`] - Connections and the process-wide registry
//!
//! # Quick Start
//! ```no_run
//! use archengine::{CompactConfig, Connection, ConnectionConfig};
//!
//! let mut config = ConnectionConfig::default();
//! config.set("cache_size", 64u64 * 1024 * 1024).unwrap();
//!
//! let conn = Connection::open("my_database", config).unwrap();
//! let tree = conn.create_tree("orders").unwrap();
//! tree.put(42, "hello").unwrap();
//! assert_eq!(tree.get(42).unwrap(), Some(b"hello".to_vec()));
//!
//! conn.checkpoint("orders").unwrap();
//! let state = conn.compact("orders", &CompactConfig::default()).unwrap();
//! println!("rewrote {} pages", state.pages_rewritten);
//! ```

pub mod block;
pub mod btree;
pub mod cache;
pub mod common;
pub mod compact;
pub mod conn;
pub mod sync;

// Re-export commonly used items at crate root for convenience
pub use common::config::{ConfigValue, ConnectionConfig, SharedCacheConfig};
pub use common::{BlockAddr, Error, Result, TreeId};

pub use block::{BlockManager, FileBlockManager};
pub use btree::{PageHandle, PageRef, RefState, Tree, WalkFlags};
pub use cache::{Cache, CachePool, CacheStats, Stat, StatsSnapshot};
pub use compact::{CompactConfig, CompactState};
pub use conn::Connection;
