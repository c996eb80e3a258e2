//! Storage backends for Cairn repositories.
//!
//! A repository lives behind one [`Backend`]: a local directory, process
//! memory, or an encrypting wrapper around another backend. Callers never
//! construct backends directly; they hand a location string to a
//! [`Resolver`], which picks the family from the URL scheme.
//!
//! ```no_run
//! # async fn example() -> cairn_common::Result<()> {
//! use cairn_storage::{Resolver, StorageConfig};
//!
//! let resolver = Resolver::with_defaults(StorageConfig::load(None)?);
//! let backend = resolver.resolve("/srv/backup")?;
//! backend.init_repository().await?;
//! backend.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Design Principles
//! - Family isolation: nothing outside a family knows how it stores data
//! - Composition: decorators wrap exactly one inner backend
//! - Async operations: all I/O goes through `async` trait methods
//! - Unified error semantics: every family reports the same error kinds

pub mod backend;
pub mod config;
pub mod crypt;
pub mod file;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod resolver;

#[cfg(test)]
mod conformance;

pub use backend::Backend;
pub use config::{CryptConfig, LockConfig, StorageConfig};
pub use crypt::CryptBackend;
pub use file::FileBackend;
pub use lock::{with_repository_lock, LockPolicy, LockRecord, RepositoryLock};
pub use memory::MemoryBackend;
pub use registry::{
    create_default_registry, register_default_backends, BackendDescriptor, BackendFactory,
    BackendKind, BackendRegistry, BackendRequest,
};
pub use resolver::{parse_location, Resolver, MAX_DECORATOR_DEPTH};
