//! Common error types for Cairn.

use thiserror::Error;

/// Top-level error type for Cairn operations.
///
/// The first group of variants is the storage taxonomy: every backend
/// operation fails with exactly one of them, carrying the underlying cause
/// as context. The remaining variants belong to the surrounding crates.
#[derive(Debug, Error)]
pub enum Error {
    /// The location string is neither a URL nor a usable filesystem path.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The URL parsed, but no backend can serve a repository there.
    #[error("Invalid repository URL: {0}")]
    InvalidRepositoryUrl(String),

    /// The backend cannot estimate free space. Not fatal.
    #[error("Available space unknown: {0}")]
    AvailableSpaceUnknown(String),

    #[error("Loading chunk failed: {0}")]
    LoadChunkFailed(String),

    #[error("Storing chunk failed: {0}")]
    StoreChunkFailed(String),

    #[error("Deleting chunk failed: {0}")]
    DeleteChunkFailed(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Storing snapshot failed: {0}")]
    StoreSnapshotFailed(String),

    #[error("Loading chunk index failed: {0}")]
    LoadChunkIndexFailed(String),

    #[error("Storing chunk index failed: {0}")]
    StoreChunkIndexFailed(String),

    #[error("Loading repository failed: {0}")]
    LoadRepositoryFailed(String),

    #[error("Storing repository failed: {0}")]
    StoreRepositoryFailed(String),

    /// The repository is locked by someone else.
    #[error("Locking repository failed: {0}")]
    LockFailed(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
