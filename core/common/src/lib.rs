//! Common utilities and types shared across Cairn crates.
//!
//! This crate holds the error taxonomy every storage backend reports
//! through, and the identity types the backend contract is keyed by.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChunkId, LockToken, SnapshotId};
