//! Storage backend contract.

use async_trait::async_trait;

use cairn_common::{ChunkId, LockToken, Result, SnapshotId};

/// Storage backend for one resolved repository location.
///
/// Every backend family implements every operation. A family that cannot
/// offer a capability returns the documented "unknown"/"failed" outcome
/// instead of a made-up value.
///
/// Instances are shared between tasks; operations addressing different
/// chunk identities may run concurrently. Concurrent writes to the same
/// identity are last-writer-wins.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Canonical URL of the resolved location (e.g. `file:///srv/repo`).
    fn location(&self) -> String;

    /// Schemes this backend family answers to.
    fn protocols(&self) -> &'static [&'static str];

    /// Human-readable label of the family.
    fn description(&self) -> &str;

    /// Release held resources. Decorators close their inner backend.
    async fn close(&self) -> Result<()>;

    /// Best-effort estimate of free space in bytes.
    ///
    /// # Errors
    /// - `AvailableSpaceUnknown` when the medium cannot tell. Callers treat
    ///   this as a normal outcome.
    async fn available_space(&self) -> Result<u64>;

    /// Fetch one physical chunk part.
    ///
    /// # Errors
    /// - `LoadChunkFailed` if the part is absent or unreadable
    async fn load_chunk(&self, id: &ChunkId) -> Result<Vec<u8>>;

    /// Persist one physical chunk part.
    ///
    /// # Postconditions
    /// - Returns the number of bytes actually written, which may differ from
    ///   `data.len()` when the backend transforms the data
    ///
    /// # Errors
    /// - `StoreChunkFailed`
    async fn store_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<u64>;

    /// Remove one physical chunk part.
    ///
    /// # Errors
    /// - `DeleteChunkFailed`, including when the part does not exist
    async fn delete_chunk(&self, id: &ChunkId) -> Result<()>;

    /// # Errors
    /// - `SnapshotNotFound`
    async fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>>;

    /// # Errors
    /// - `StoreSnapshotFailed`
    async fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()>;

    /// # Errors
    /// - `LoadChunkIndexFailed`
    async fn load_chunk_index(&self) -> Result<Vec<u8>>;

    /// # Errors
    /// - `StoreChunkIndexFailed`
    async fn save_chunk_index(&self, data: &[u8]) -> Result<()>;

    /// Create the physical structures of a new repository.
    ///
    /// # Errors
    /// - `InvalidRepositoryUrl` if the location is unsuitable or already
    ///   holds a repository. Never merges into an existing one.
    async fn init_repository(&self) -> Result<()>;

    /// # Errors
    /// - `LoadRepositoryFailed`
    async fn load_repository(&self) -> Result<Vec<u8>>;

    /// # Errors
    /// - `StoreRepositoryFailed`
    async fn save_repository(&self, data: &[u8]) -> Result<()>;

    /// Acquire or renew exclusive access to the repository.
    ///
    /// Passing the token currently held renews the lock. Passing `None` or
    /// any other token while an unexpired lock exists fails.
    ///
    /// # Returns
    /// - `Some(token)` when the lock is granted
    /// - `None` when the backend cannot enforce mutual exclusion; callers
    ///   must fall back to advisory coordination
    ///
    /// # Errors
    /// - `LockFailed` when another holder owns an unexpired lock
    async fn lock_repository(&self, current: Option<&LockToken>) -> Result<Option<LockToken>>;

    /// Release the lock unconditionally. The token is not re-verified.
    ///
    /// # Errors
    /// - `LockFailed` if the lock could not be removed
    async fn unlock_repository(&self) -> Result<()>;
}
