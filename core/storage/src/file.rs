//! Local filesystem storage backend.
//!
//! Repository layout under the root directory:
//!
//! ```text
//! repository                          repository metadata
//! index                               chunk index
//! snapshots/<id>                      one file per snapshot
//! chunks/<cc>/<checksum>.<part>_<n>   cc = first two checksum characters
//! lock                                token of the current lock holder
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so readers never observe a partially written blob.

use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::backend::Backend;
use crate::lock::{arbitrate, LockDecision, LockPolicy};
use cairn_common::{ChunkId, Error, LockToken, Result, SnapshotId};

const REPOSITORY_FILE: &str = "repository";
const INDEX_FILE: &str = "index";
const LOCK_FILE: &str = "lock";
const SNAPSHOTS_DIR: &str = "snapshots";
const CHUNKS_DIR: &str = "chunks";

/// Local filesystem storage backend.
pub struct FileBackend {
    url: Url,
    root: PathBuf,
    policy: LockPolicy,
    /// Orders lock and unlock calls made through this instance.
    lock_gate: Mutex<()>,
}

impl FileBackend {
    pub const PROTOCOLS: &'static [&'static str] = &["file"];
    pub const DESCRIPTION: &'static str = "Local file storage";

    /// Create a backend for a `file://` URL.
    ///
    /// Does not touch the filesystem; the directory is created by
    /// [`Backend::init_repository`].
    ///
    /// # Errors
    /// - `InvalidRepositoryUrl` if the URL is not a local `file` URL
    pub fn new(url: &Url, policy: LockPolicy) -> Result<Self> {
        if url.scheme() != "file" {
            return Err(Error::InvalidRepositoryUrl(format!(
                "File backend cannot serve '{}' URLs",
                url.scheme()
            )));
        }
        let root = url.to_file_path().map_err(|_| {
            Error::InvalidRepositoryUrl(format!("{} does not name a local path", url))
        })?;

        Ok(Self {
            url: url.clone(),
            root,
            policy,
            lock_gate: Mutex::new(()),
        })
    }

    /// Create a backend for an absolute directory path.
    pub fn from_path(path: impl AsRef<Path>, policy: LockPolicy) -> Result<Self> {
        let path = path.as_ref();
        let url = Url::from_file_path(path).map_err(|_| {
            Error::InvalidRepositoryUrl(format!("{} is not an absolute path", path.display()))
        })?;
        Self::new(&url, policy)
    }

    /// Root directory of the repository.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let checksum = id.checksum();
        let shard = &checksum[..checksum.len().min(2)];
        self.root
            .join(CHUNKS_DIR)
            .join(shard)
            .join(id.to_string())
    }

    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(id.as_str())
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Write a lock file that must not exist yet.
    async fn create_lock_file(&self, token: &LockToken) -> Result<()> {
        let path = self.lock_path();
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::LockFailed(
                    "Repository was locked concurrently".to_string(),
                ))
            }
            Err(e) => return Err(Error::LockFailed(describe(&path, e))),
        };

        use tokio::io::AsyncWriteExt;
        file.write_all(token.as_bytes())
            .await
            .map_err(|e| Error::LockFailed(describe(&path, e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::LockFailed(describe(&path, e)))
    }

    /// Move the lock file holding `replaced` out of the way.
    ///
    /// Only one contender can move a given file. If the file moved is not
    /// the one expected (someone else already replaced it), it is put back
    /// and the attempt fails.
    async fn evict_lock_file(&self, replaced: &LockToken) -> Result<()> {
        let path = self.lock_path();
        let aside = self.root.join(format!("{}.stale-{}", LOCK_FILE, Uuid::new_v4()));

        fs::rename(&path, &aside).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::LockFailed("Repository lock was replaced concurrently".to_string())
            } else {
                Error::LockFailed(describe(&path, e))
            }
        })?;

        let moved = fs::read(&aside)
            .await
            .map_err(|e| Error::LockFailed(describe(&aside, e)))?;
        if moved != replaced.as_bytes() {
            if let Err(e) = fs::hard_link(&aside, &path).await {
                warn!(error = %e, "Failed to restore a concurrently acquired lock");
            }
            if let Err(e) = fs::remove_file(&aside).await {
                debug!(error = %e, "Failed to remove displaced lock file");
            }
            return Err(Error::LockFailed(
                "Repository lock was replaced concurrently".to_string(),
            ));
        }

        if let Err(e) = fs::remove_file(&aside).await {
            debug!(error = %e, "Failed to remove evicted lock file");
        }
        Ok(())
    }
}

fn describe(path: &Path, e: io::Error) -> String {
    format!("{}: {}", path.display(), e)
}

/// Write `data` to `path` through a temporary sibling and a rename.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    let tmp = parent.join(format!(".{}.tmp-{}", name, Uuid::new_v4()));

    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Part count recorded for `checksum` by parts already in `shard`.
async fn stored_total_parts(shard: &Path, checksum: &str) -> io::Result<Option<u32>> {
    let mut entries = match fs::read_dir(shard).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let prefix = format!("{}.", checksum);
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let total = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix.as_str()))
            .and_then(|rest| rest.split_once('_'))
            .and_then(|(_, total)| total.parse::<u32>().ok());
        if total.is_some() {
            return Ok(total);
        }
    }
    Ok(None)
}

async fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::create_dir(path).await {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn free_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs only writes into the struct we pass; zeroed is a
    // valid initial value for it.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and outlives the call.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space query is not supported on this platform",
    ))
}

#[async_trait]
impl Backend for FileBackend {
    fn location(&self) -> String {
        self.url.to_string()
    }

    fn protocols(&self) -> &'static [&'static str] {
        Self::PROTOCOLS
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn available_space(&self) -> Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            // The repository directory may not exist yet; ask about the
            // filesystem it would live on.
            let existing = root.ancestors().find(|p| p.exists()).unwrap_or(&root);
            free_space(existing).map_err(|e| Error::AvailableSpaceUnknown(describe(existing, e)))
        })
        .await
        .map_err(|e| Error::AvailableSpaceUnknown(format!("Free space query failed: {}", e)))?
    }

    async fn load_chunk(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let path = self.chunk_path(id);
        fs::read(&path)
            .await
            .map_err(|e| Error::LoadChunkFailed(describe(&path, e)))
    }

    async fn store_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<u64> {
        let path = self.chunk_path(id);
        if let Some(shard) = path.parent() {
            ensure_dir(shard)
                .await
                .map_err(|e| Error::StoreChunkFailed(describe(shard, e)))?;

            let stored = stored_total_parts(shard, id.checksum())
                .await
                .map_err(|e| Error::StoreChunkFailed(describe(shard, e)))?;
            if let Some(total) = stored.filter(|&total| total != id.total_parts()) {
                return Err(Error::StoreChunkFailed(format!(
                    "Chunk {} already stored with {} parts",
                    id.checksum(),
                    total
                )));
            }
        }
        write_atomic(&path, data)
            .await
            .map_err(|e| Error::StoreChunkFailed(describe(&path, e)))?;

        debug!(chunk = %id, size = data.len(), "Stored chunk");
        Ok(data.len() as u64)
    }

    async fn delete_chunk(&self, id: &ChunkId) -> Result<()> {
        let path = self.chunk_path(id);
        fs::remove_file(&path)
            .await
            .map_err(|e| Error::DeleteChunkFailed(describe(&path, e)))
    }

    async fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        let path = self.snapshot_path(id);
        fs::read(&path)
            .await
            .map_err(|e| Error::SnapshotNotFound(describe(&path, e)))
    }

    async fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        let path = self.snapshot_path(id);
        write_atomic(&path, data)
            .await
            .map_err(|e| Error::StoreSnapshotFailed(describe(&path, e)))
    }

    async fn load_chunk_index(&self) -> Result<Vec<u8>> {
        let path = self.root.join(INDEX_FILE);
        fs::read(&path)
            .await
            .map_err(|e| Error::LoadChunkIndexFailed(describe(&path, e)))
    }

    async fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        write_atomic(&path, data)
            .await
            .map_err(|e| Error::StoreChunkIndexFailed(describe(&path, e)))
    }

    async fn init_repository(&self) -> Result<()> {
        let unsuitable = |e: io::Error| Error::InvalidRepositoryUrl(describe(&self.root, e));

        match fs::metadata(&self.root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::InvalidRepositoryUrl(format!(
                    "{} is not a directory",
                    self.root.display()
                )));
            }
            Ok(_) => {
                let mut entries = fs::read_dir(&self.root).await.map_err(unsuitable)?;
                if entries.next_entry().await.map_err(unsuitable)?.is_some() {
                    return Err(Error::InvalidRepositoryUrl(format!(
                        "{} is not empty",
                        self.root.display()
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.root).await.map_err(unsuitable)?;
            }
            Err(e) => return Err(unsuitable(e)),
        }

        fs::create_dir(self.root.join(SNAPSHOTS_DIR))
            .await
            .map_err(unsuitable)?;
        fs::create_dir(self.root.join(CHUNKS_DIR))
            .await
            .map_err(unsuitable)?;

        info!(location = %self.url, "Initialized repository");
        Ok(())
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        let path = self.root.join(REPOSITORY_FILE);
        fs::read(&path)
            .await
            .map_err(|e| Error::LoadRepositoryFailed(describe(&path, e)))
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        let path = self.root.join(REPOSITORY_FILE);
        write_atomic(&path, data)
            .await
            .map_err(|e| Error::StoreRepositoryFailed(describe(&path, e)))
    }

    async fn lock_repository(&self, current: Option<&LockToken>) -> Result<Option<LockToken>> {
        let _gate = self.lock_gate.lock().await;
        let path = self.lock_path();

        let held = match fs::read(&path).await {
            Ok(bytes) => Some(LockToken::from_bytes(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::LockFailed(describe(&path, e))),
        };

        let decision = arbitrate(held.as_ref(), current, Utc::now())?;
        let token = self.policy.issue().to_token()?;

        if let LockDecision::TakeOver { previous } = &decision {
            warn!(
                location = %self.url,
                pid = previous.pid,
                expired_at = %previous.expires_at,
                "Taking over expired repository lock"
            );
        }

        // Renewal and takeover both replace the file that was read. Only the
        // rename-aside may remove it, so a concurrent replacement is noticed.
        if let Some(replaced) = held.as_ref() {
            self.evict_lock_file(replaced).await?;
        }
        self.create_lock_file(&token).await?;

        debug!(location = %self.url, "Repository lock granted");
        Ok(Some(token))
    }

    async fn unlock_repository(&self) -> Result<()> {
        let _gate = self.lock_gate.lock().await;
        let path = self.lock_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LockFailed(describe(&path, e))),
        }
    }
}
