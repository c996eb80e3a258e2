//! Behaviour every backend family must show.
//!
//! Each family's tests call [`run`] on a fresh, uninitialized instance.

use async_trait::async_trait;
use futures::future::join_all;

use crate::backend::Backend;
use cairn_common::{ChunkId, Error, LockToken, Result, SnapshotId};

/// Run the full suite against an empty backend.
pub(crate) async fn run(backend: &dyn Backend) {
    init_only_once(backend).await;
    chunk_round_trip(backend).await;
    multipart_chunks(backend).await;
    mismatched_part_count(backend).await;
    delete_chunk(backend).await;
    snapshots(backend).await;
    chunk_index(backend).await;
    repository_metadata(backend).await;
    concurrent_stores(backend).await;
    lock_cycle(backend).await;
    racing_lock_attempts(&[backend; 8]).await;
}

async fn init_only_once(backend: &dyn Backend) {
    backend.init_repository().await.unwrap();
    assert!(matches!(
        backend.init_repository().await,
        Err(Error::InvalidRepositoryUrl(_))
    ));
}

async fn chunk_round_trip(backend: &dyn Backend) {
    let id = ChunkId::single("0a1b2c3d").unwrap();
    let data = b"chunk payload".to_vec();

    let written = backend.store_chunk(&id, &data).await.unwrap();
    assert!(written >= data.len() as u64);
    assert_eq!(backend.load_chunk(&id).await.unwrap(), data);

    // Rewriting the same identity is allowed; the last write wins.
    backend.store_chunk(&id, b"newer").await.unwrap();
    assert_eq!(backend.load_chunk(&id).await.unwrap(), b"newer");

    let empty = ChunkId::single("e0").unwrap();
    backend.store_chunk(&empty, b"").await.unwrap();
    assert!(backend.load_chunk(&empty).await.unwrap().is_empty());
}

async fn multipart_chunks(backend: &dyn Backend) {
    let parts: Vec<ChunkId> = (0..3)
        .map(|part| ChunkId::new("5eed", part, 3).unwrap())
        .collect();
    for id in &parts {
        backend
            .store_chunk(id, format!("part {}", id.part()).as_bytes())
            .await
            .unwrap();
    }
    for id in &parts {
        let data = backend.load_chunk(id).await.unwrap();
        assert_eq!(data, format!("part {}", id.part()).into_bytes());
    }

    let missing = ChunkId::single("5eed").unwrap();
    assert!(matches!(
        backend.load_chunk(&missing).await,
        Err(Error::LoadChunkFailed(_))
    ));
}

async fn mismatched_part_count(backend: &dyn Backend) {
    let first = ChunkId::new("ab12", 0, 2).unwrap();
    backend.store_chunk(&first, b"half").await.unwrap();

    let conflicting = ChunkId::new("ab12", 0, 3).unwrap();
    assert!(matches!(
        backend.store_chunk(&conflicting, b"third").await,
        Err(Error::StoreChunkFailed(_))
    ));
    assert!(matches!(
        backend.load_chunk(&conflicting).await,
        Err(Error::LoadChunkFailed(_))
    ));

    let second = ChunkId::new("ab12", 1, 2).unwrap();
    backend.store_chunk(&second, b"other half").await.unwrap();
    assert_eq!(backend.load_chunk(&first).await.unwrap(), b"half");
}

async fn delete_chunk(backend: &dyn Backend) {
    let id = ChunkId::single("dead").unwrap();
    backend.store_chunk(&id, b"doomed").await.unwrap();
    backend.delete_chunk(&id).await.unwrap();

    assert!(matches!(
        backend.load_chunk(&id).await,
        Err(Error::LoadChunkFailed(_))
    ));
    assert!(matches!(
        backend.delete_chunk(&id).await,
        Err(Error::DeleteChunkFailed(_))
    ));
}

async fn snapshots(backend: &dyn Backend) {
    let id = SnapshotId::new("2024-01-01_full").unwrap();
    assert!(matches!(
        backend.load_snapshot(&id).await,
        Err(Error::SnapshotNotFound(_))
    ));

    backend.save_snapshot(&id, b"snapshot one").await.unwrap();
    assert_eq!(backend.load_snapshot(&id).await.unwrap(), b"snapshot one");

    backend.save_snapshot(&id, b"snapshot two").await.unwrap();
    assert_eq!(backend.load_snapshot(&id).await.unwrap(), b"snapshot two");
}

async fn chunk_index(backend: &dyn Backend) {
    assert!(matches!(
        backend.load_chunk_index().await,
        Err(Error::LoadChunkIndexFailed(_))
    ));
    backend.save_chunk_index(b"index v1").await.unwrap();
    backend.save_chunk_index(b"index v2").await.unwrap();
    assert_eq!(backend.load_chunk_index().await.unwrap(), b"index v2");
}

async fn repository_metadata(backend: &dyn Backend) {
    assert!(matches!(
        backend.load_repository().await,
        Err(Error::LoadRepositoryFailed(_))
    ));
    backend.save_repository(b"metadata").await.unwrap();
    assert_eq!(backend.load_repository().await.unwrap(), b"metadata");

    // A repository that has metadata cannot be initialized again.
    assert!(backend.init_repository().await.is_err());
}

async fn concurrent_stores(backend: &dyn Backend) {
    let ids: Vec<ChunkId> = (0..16)
        .map(|i| ChunkId::single(format!("c0{:02x}", i)).unwrap())
        .collect();

    let stores = ids
        .iter()
        .map(|id| async move { backend.store_chunk(id, id.checksum().as_bytes()).await });
    for result in join_all(stores).await {
        result.unwrap();
    }

    let loads = ids.iter().map(|id| backend.load_chunk(id));
    for (id, data) in ids.iter().zip(join_all(loads).await) {
        assert_eq!(data.unwrap(), id.checksum().as_bytes());
    }
}

async fn lock_cycle(backend: &dyn Backend) {
    let token = backend.lock_repository(None).await.unwrap().unwrap();
    assert!(!token.is_empty());

    assert!(matches!(
        backend.lock_repository(None).await,
        Err(Error::LockFailed(_))
    ));
    let foreign = LockToken::from_bytes(b"someone else".to_vec());
    assert!(matches!(
        backend.lock_repository(Some(&foreign)).await,
        Err(Error::LockFailed(_))
    ));

    let renewed = backend.lock_repository(Some(&token)).await.unwrap().unwrap();
    assert_ne!(renewed, token);
    assert!(matches!(
        backend.lock_repository(Some(&token)).await,
        Err(Error::LockFailed(_))
    ));

    backend.unlock_repository().await.unwrap();
    backend.unlock_repository().await.unwrap();

    let again = backend.lock_repository(None).await.unwrap().unwrap();
    assert!(!again.is_empty());
    backend.unlock_repository().await.unwrap();
}

/// Lock attempts made at the same time through `handles`, which may be one
/// instance repeated or several instances of the same repository. Exactly
/// one attempt wins.
pub(crate) async fn racing_lock_attempts(handles: &[&dyn Backend]) {
    let attempts = handles.iter().map(|backend| backend.lock_repository(None));
    let outcomes = join_all(attempts).await;

    let mut winners = 0;
    for outcome in outcomes {
        match outcome {
            Ok(Some(_)) => winners += 1,
            Err(Error::LockFailed(_)) => {}
            other => panic!("unexpected lock outcome: {:?}", other),
        }
    }
    assert_eq!(winners, 1);

    handles[0].unlock_repository().await.unwrap();
}

/// For an initialized backend whose tokens expire immediately.
pub(crate) async fn expired_lock_is_taken_over(backend: &dyn Backend) {
    let stale = backend.lock_repository(None).await.unwrap().unwrap();
    let fresh = backend.lock_repository(None).await.unwrap().unwrap();
    assert_ne!(stale, fresh);
    backend.unlock_repository().await.unwrap();
}

/// Forwards everything except locking, which it reports as unsupported.
pub(crate) struct NoLockBackend<B> {
    inner: B,
}

impl<B: Backend> NoLockBackend<B> {
    pub(crate) fn new(inner: B) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<B: Backend> Backend for NoLockBackend<B> {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn protocols(&self) -> &'static [&'static str] {
        self.inner.protocols()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn available_space(&self) -> Result<u64> {
        self.inner.available_space().await
    }

    async fn load_chunk(&self, id: &ChunkId) -> Result<Vec<u8>> {
        self.inner.load_chunk(id).await
    }

    async fn store_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<u64> {
        self.inner.store_chunk(id, data).await
    }

    async fn delete_chunk(&self, id: &ChunkId) -> Result<()> {
        self.inner.delete_chunk(id).await
    }

    async fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        self.inner.load_snapshot(id).await
    }

    async fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        self.inner.save_snapshot(id, data).await
    }

    async fn load_chunk_index(&self) -> Result<Vec<u8>> {
        self.inner.load_chunk_index().await
    }

    async fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        self.inner.save_chunk_index(data).await
    }

    async fn init_repository(&self) -> Result<()> {
        self.inner.init_repository().await
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        self.inner.load_repository().await
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.inner.save_repository(data).await
    }

    async fn lock_repository(&self, _current: Option<&LockToken>) -> Result<Option<LockToken>> {
        Ok(None)
    }

    async fn unlock_repository(&self) -> Result<()> {
        Ok(())
    }
}
