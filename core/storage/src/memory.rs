//! In-memory storage backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::backend::Backend;
use crate::lock::{arbitrate, LockDecision, LockPolicy};
use cairn_common::{ChunkId, Error, LockToken, Result, SnapshotId};

/// Stored parts of one logical chunk.
#[derive(Debug, Default)]
struct ChunkParts {
    total_parts: u32,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    repository: Option<Vec<u8>>,
    chunk_index: Option<Vec<u8>>,
    snapshots: HashMap<SnapshotId, Vec<u8>>,
    chunks: HashMap<String, ChunkParts>,
    lock: Option<LockToken>,
}

/// In-memory storage backend.
///
/// Useful for testing and dry runs. All data lives in the instance and is
/// lost on close or drop. Free space is reported as unknown.
pub struct MemoryBackend {
    location: String,
    policy: LockPolicy,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub const PROTOCOLS: &'static [&'static str] = &["mem"];
    pub const DESCRIPTION: &'static str = "Memory storage";

    /// Create an empty backend at `mem:`.
    pub fn new() -> Self {
        Self::create("mem:".to_string(), LockPolicy::default())
    }

    /// Create an empty backend for a resolved `mem:` URL.
    pub fn with_url(url: &Url, policy: LockPolicy) -> Self {
        Self::create(url.to_string(), policy)
    }

    fn create(location: String, policy: LockPolicy) -> Self {
        Self {
            location,
            policy,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn protocols(&self) -> &'static [&'static str] {
        Self::PROTOCOLS
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().await = State::default();
        Ok(())
    }

    async fn available_space(&self) -> Result<u64> {
        Err(Error::AvailableSpaceUnknown(
            "memory storage has no fixed capacity".to_string(),
        ))
    }

    async fn load_chunk(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .chunks
            .get(id.checksum())
            .filter(|entry| entry.total_parts == id.total_parts())
            .and_then(|entry| entry.parts.get(&id.part()))
            .cloned()
            .ok_or_else(|| Error::LoadChunkFailed(format!("Chunk not found: {}", id)))
    }

    async fn store_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let entry = state
            .chunks
            .entry(id.checksum().to_string())
            .or_insert_with(|| ChunkParts {
                total_parts: id.total_parts(),
                parts: BTreeMap::new(),
            });

        if entry.total_parts != id.total_parts() {
            return Err(Error::StoreChunkFailed(format!(
                "Chunk {} already stored with {} parts",
                id.checksum(),
                entry.total_parts
            )));
        }

        entry.parts.insert(id.part(), data.to_vec());
        debug!(chunk = %id, size = data.len(), "Stored chunk in memory");
        Ok(data.len() as u64)
    }

    async fn delete_chunk(&self, id: &ChunkId) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .chunks
            .get_mut(id.checksum())
            .filter(|entry| entry.total_parts == id.total_parts())
            .ok_or_else(|| Error::DeleteChunkFailed(format!("Chunk not found: {}", id)))?;

        if entry.parts.remove(&id.part()).is_none() {
            return Err(Error::DeleteChunkFailed(format!("Chunk not found: {}", id)));
        }
        if entry.parts.is_empty() {
            state.chunks.remove(id.checksum());
        }
        Ok(())
    }

    async fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        self.state
            .lock()
            .await
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))
    }

    async fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        self.state
            .lock()
            .await
            .snapshots
            .insert(id.clone(), data.to_vec());
        Ok(())
    }

    async fn load_chunk_index(&self) -> Result<Vec<u8>> {
        self.state
            .lock()
            .await
            .chunk_index
            .clone()
            .ok_or_else(|| Error::LoadChunkIndexFailed("No chunk index stored".to_string()))
    }

    async fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        self.state.lock().await.chunk_index = Some(data.to_vec());
        Ok(())
    }

    async fn init_repository(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized || state.repository.is_some() {
            return Err(Error::InvalidRepositoryUrl(format!(
                "Repository already exists at {}",
                self.location
            )));
        }
        state.initialized = true;
        Ok(())
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        self.state
            .lock()
            .await
            .repository
            .clone()
            .ok_or_else(|| Error::LoadRepositoryFailed("No repository stored".to_string()))
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.state.lock().await.repository = Some(data.to_vec());
        Ok(())
    }

    async fn lock_repository(&self, current: Option<&LockToken>) -> Result<Option<LockToken>> {
        let mut state = self.state.lock().await;
        let decision = arbitrate(state.lock.as_ref(), current, Utc::now())?;
        if let LockDecision::TakeOver { previous } = &decision {
            warn!(
                pid = previous.pid,
                expired_at = %previous.expires_at,
                "Taking over expired repository lock"
            );
        }

        let token = self.policy.issue().to_token()?;
        state.lock = Some(token.clone());
        Ok(Some(token))
    }

    async fn unlock_repository(&self) -> Result<()> {
        self.state.lock().await.lock = None;
        Ok(())
    }
}
