//! Common types and utilities shared across archengine.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration structs and named options
//! - Error types
//! - Identifiers (TreeId, BlockAddr)

pub mod config;
pub mod error;
mod addr;
mod tree_id;

pub use addr::BlockAddr;
pub use error::{fatal, Error, Result};
pub use tree_id::TreeId;
