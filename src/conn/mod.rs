//! Connections and the process-wide registry they share.
//!
//! - [`Connection`] - one engine instance: cache, trees, eviction workers
//! - [`registry`] - open connections and named cache pools in this process

mod connection;
pub mod registry;

pub use connection::{Connection, TREE_FILE_EXTENSION};
