//! Encrypting backend wrapper.
//!
//! Wraps exactly one inner backend and seals every blob it stores with
//! XChaCha20-Poly1305. The inner backend only ever sees ciphertext and needs
//! no knowledge of the wrapping.
//!
//! Key material: a master key is derived from the passphrase with Argon2id
//! and a random salt chosen when the repository is initialized. Each blob
//! class uses its own subkey, and each blob is bound to its identity through
//! associated data, so ciphertexts cannot be swapped between slots.
//!
//! The salt, KDF parameters and a key-check value are kept in a header in
//! front of the repository metadata blob:
//!
//! ```text
//! "CRPT" | u32 header length (LE) | header JSON | sealed metadata (may be empty)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::Backend;
use cairn_common::{ChunkId, Error, LockToken, Result, SnapshotId};
use cairn_crypto::{derive_key, open, seal, KdfParams, MasterKey, Passphrase, Salt, SubKey};

const MAGIC: &[u8; 4] = b"CRPT";
const HEADER_VERSION: u32 = 1;
const KEY_CHECK: &[u8] = b"cairn-key-check";

const CHUNK_CONTEXT: &[u8] = b"chunk";
const SNAPSHOT_CONTEXT: &[u8] = b"snapshot";
const INDEX_CONTEXT: &[u8] = b"index";
const REPOSITORY_CONTEXT: &[u8] = b"repository";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CryptHeader {
    version: u32,
    salt: Salt,
    kdf: KdfParams,
    /// `KEY_CHECK` sealed with the repository subkey.
    key_check: Vec<u8>,
}

fn encode_envelope(header: &CryptHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(header)
        .map_err(|e| Error::Serialization(format!("Failed to encode encryption header: {}", e)))?;
    let len = u32::try_from(json.len())
        .map_err(|_| Error::Serialization("Encryption header too large".to_string()))?;

    let mut blob = Vec::with_capacity(MAGIC.len() + 4 + json.len() + payload.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&len.to_le_bytes());
    blob.extend_from_slice(&json);
    blob.extend_from_slice(payload);
    Ok(blob)
}

fn decode_envelope(blob: &[u8]) -> Result<(CryptHeader, &[u8])> {
    let malformed = || Error::Serialization("Repository is not encrypted or is damaged".to_string());

    let rest = blob.strip_prefix(MAGIC.as_slice()).ok_or_else(malformed)?;
    let (len, rest) = rest.split_first_chunk::<4>().ok_or_else(malformed)?;
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len {
        return Err(malformed());
    }
    let (json, payload) = rest.split_at(len);

    let header: CryptHeader = serde_json::from_slice(json)
        .map_err(|e| Error::Serialization(format!("Invalid encryption header: {}", e)))?;
    if header.version != HEADER_VERSION {
        return Err(Error::Serialization(format!(
            "Unsupported encryption header version {}",
            header.version
        )));
    }
    Ok((header, payload))
}

/// Subkeys of an unlocked repository.
struct Keyring {
    header: CryptHeader,
    chunk: SubKey,
    snapshot: SubKey,
    index: SubKey,
    repository: SubKey,
}

impl Keyring {
    fn new(master: &MasterKey, header: CryptHeader) -> Self {
        Self {
            header,
            chunk: master.derive_subkey(CHUNK_CONTEXT),
            snapshot: master.derive_subkey(SNAPSHOT_CONTEXT),
            index: master.derive_subkey(INDEX_CONTEXT),
            repository: master.derive_subkey(REPOSITORY_CONTEXT),
        }
    }

    fn verify(&self) -> Result<()> {
        match open(self.repository.as_bytes(), &self.header.key_check, b"key-check") {
            Ok(check) if check == KEY_CHECK => Ok(()),
            _ => Err(Error::Crypto("Wrong passphrase".to_string())),
        }
    }
}

fn chunk_aad(id: &ChunkId) -> Vec<u8> {
    format!("chunk:{}", id).into_bytes()
}

fn snapshot_aad(id: &SnapshotId) -> Vec<u8> {
    format!("snapshot:{}", id).into_bytes()
}

/// Backend decorator that encrypts everything stored through it.
pub struct CryptBackend {
    inner: Box<dyn Backend>,
    passphrase: Passphrase,
    kdf: KdfParams,
    /// Cleared on close; replaced by `init_repository`.
    keyring: RwLock<Option<Arc<Keyring>>>,
}

impl CryptBackend {
    pub const PROTOCOLS: &'static [&'static str] = &["crypt"];
    pub const DESCRIPTION: &'static str = "Encryption wrapper (XChaCha20-Poly1305)";

    /// Wrap `inner`.
    ///
    /// `kdf` only applies when this instance initializes a new repository.
    ///
    /// # Errors
    /// - `InvalidRepositoryUrl` if the passphrase is empty
    pub fn new(inner: Box<dyn Backend>, passphrase: Passphrase, kdf: KdfParams) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::InvalidRepositoryUrl(
                "Encrypted repositories need a non-empty passphrase".to_string(),
            ));
        }
        Ok(Self {
            inner,
            passphrase,
            kdf,
            keyring: RwLock::new(None),
        })
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &dyn Backend {
        self.inner.as_ref()
    }

    async fn derive_master(&self, salt: &Salt, kdf: &KdfParams) -> Result<MasterKey> {
        let passphrase = self.passphrase.clone();
        let salt = salt.clone();
        let kdf = kdf.clone();
        tokio::task::spawn_blocking(move || derive_key(passphrase.as_bytes(), &salt, &kdf))
            .await
            .map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))?
    }

    /// Keys of the wrapped repository, derived on first use.
    async fn keyring(&self) -> Result<Arc<Keyring>> {
        if let Some(keys) = self.keyring.read().await.as_ref() {
            return Ok(Arc::clone(keys));
        }

        let mut slot = self.keyring.write().await;
        if let Some(keys) = slot.as_ref() {
            return Ok(Arc::clone(keys));
        }

        let blob = self.inner.load_repository().await?;
        let (header, _) = decode_envelope(&blob)?;
        let master = self.derive_master(&header.salt, &header.kdf).await?;
        let keyring = Keyring::new(&master, header);
        keyring.verify()?;
        debug!(location = %self.inner.location(), "Unlocked repository keys");

        let keys = Arc::new(keyring);
        *slot = Some(Arc::clone(&keys));
        Ok(keys)
    }

    /// Header and keys for a new repository. Touches no storage.
    async fn new_keyring(&self) -> Result<Keyring> {
        let salt = Salt::generate();
        let master = self.derive_master(&salt, &self.kdf).await?;
        let key_check = seal(
            master.derive_subkey(REPOSITORY_CONTEXT).as_bytes(),
            KEY_CHECK,
            b"key-check",
        )?;

        let header = CryptHeader {
            version: HEADER_VERSION,
            salt,
            kdf: self.kdf.clone(),
            key_check,
        };
        Ok(Keyring::new(&master, header))
    }
}

#[async_trait]
impl Backend for CryptBackend {
    fn location(&self) -> String {
        format!("crypt:{}", self.inner.location())
    }

    fn protocols(&self) -> &'static [&'static str] {
        Self::PROTOCOLS
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    async fn close(&self) -> Result<()> {
        *self.keyring.write().await = None;
        self.inner.close().await
    }

    async fn available_space(&self) -> Result<u64> {
        self.inner.available_space().await
    }

    async fn load_chunk(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::LoadChunkFailed(e.to_string()))?;
        let sealed = self.inner.load_chunk(id).await?;
        open(keys.chunk.as_bytes(), &sealed, &chunk_aad(id))
            .map_err(|e| Error::LoadChunkFailed(format!("{}: {}", id, e)))
    }

    async fn store_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<u64> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::StoreChunkFailed(e.to_string()))?;
        let sealed = seal(keys.chunk.as_bytes(), data, &chunk_aad(id))
            .map_err(|e| Error::StoreChunkFailed(format!("{}: {}", id, e)))?;
        self.inner.store_chunk(id, &sealed).await
    }

    async fn delete_chunk(&self, id: &ChunkId) -> Result<()> {
        self.inner.delete_chunk(id).await
    }

    async fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::SnapshotNotFound(format!("{}: {}", id, e)))?;
        let sealed = self.inner.load_snapshot(id).await?;
        open(keys.snapshot.as_bytes(), &sealed, &snapshot_aad(id))
            .map_err(|e| Error::SnapshotNotFound(format!("{}: {}", id, e)))
    }

    async fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::StoreSnapshotFailed(e.to_string()))?;
        let sealed = seal(keys.snapshot.as_bytes(), data, &snapshot_aad(id))
            .map_err(|e| Error::StoreSnapshotFailed(format!("{}: {}", id, e)))?;
        self.inner.save_snapshot(id, &sealed).await
    }

    async fn load_chunk_index(&self) -> Result<Vec<u8>> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::LoadChunkIndexFailed(e.to_string()))?;
        let sealed = self.inner.load_chunk_index().await?;
        open(keys.index.as_bytes(), &sealed, INDEX_CONTEXT)
            .map_err(|e| Error::LoadChunkIndexFailed(e.to_string()))
    }

    async fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::StoreChunkIndexFailed(e.to_string()))?;
        let sealed = seal(keys.index.as_bytes(), data, INDEX_CONTEXT)
            .map_err(|e| Error::StoreChunkIndexFailed(e.to_string()))?;
        self.inner.save_chunk_index(&sealed).await
    }

    async fn init_repository(&self) -> Result<()> {
        // Everything that can fail on bad settings happens before the inner
        // repository exists.
        let unsuitable = |e: Error| Error::InvalidRepositoryUrl(e.to_string());
        let keyring = self.new_keyring().await.map_err(unsuitable)?;
        let blob = encode_envelope(&keyring.header, &[]).map_err(unsuitable)?;

        self.inner.init_repository().await?;
        self.inner.save_repository(&blob).await.map_err(|e| {
            Error::InvalidRepositoryUrl(format!(
                "{} was created but its encryption header could not be written, \
                 remove it before retrying: {}",
                self.inner.location(),
                e
            ))
        })?;

        *self.keyring.write().await = Some(Arc::new(keyring));
        info!(location = %self.location(), "Initialized encrypted repository");
        Ok(())
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::LoadRepositoryFailed(e.to_string()))?;
        let blob = self.inner.load_repository().await?;
        let (_, payload) =
            decode_envelope(&blob).map_err(|e| Error::LoadRepositoryFailed(e.to_string()))?;
        if payload.is_empty() {
            return Err(Error::LoadRepositoryFailed(
                "Repository metadata has not been saved yet".to_string(),
            ));
        }
        open(keys.repository.as_bytes(), payload, REPOSITORY_CONTEXT)
            .map_err(|e| Error::LoadRepositoryFailed(e.to_string()))
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        let keys = self
            .keyring()
            .await
            .map_err(|e| Error::StoreRepositoryFailed(e.to_string()))?;
        let sealed = seal(keys.repository.as_bytes(), data, REPOSITORY_CONTEXT)
            .map_err(|e| Error::StoreRepositoryFailed(e.to_string()))?;
        let blob = encode_envelope(&keys.header, &sealed)
            .map_err(|e| Error::StoreRepositoryFailed(e.to_string()))?;
        self.inner.save_repository(&blob).await
    }

    async fn lock_repository(&self, current: Option<&LockToken>) -> Result<Option<LockToken>> {
        self.inner.lock_repository(current).await
    }

    async fn unlock_repository(&self) -> Result<()> {
        self.inner.unlock_repository().await
    }
}
