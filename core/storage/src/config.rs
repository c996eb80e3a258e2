//! Storage configuration.
//!
//! Settings that backend factories need at resolution time. Loaded from a
//! JSON document; every field is optional. Environment variables override
//! the file so secrets need not be written to disk.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::lock::{LockPolicy, DEFAULT_LOCK_TTL_SECS};
use cairn_common::{Error, Result};
use cairn_crypto::{KdfParams, Passphrase};

/// Overrides `crypt.passphrase`.
pub const PASSPHRASE_ENV: &str = "CAIRN_PASSPHRASE";

/// Overrides `lock.ttl_secs`.
pub const LOCK_TTL_ENV: &str = "CAIRN_LOCK_TTL";

/// Top-level storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub lock: LockConfig,
    pub crypt: CryptConfig,
}

/// Repository lock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Seconds a lock token stays valid without renewal.
    pub ttl_secs: u64,
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy::from_secs(self.ttl_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

/// Settings of the encrypting wrapper.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    pub passphrase: Option<Passphrase>,
    /// Argon2id parameters for newly initialized repositories. Existing
    /// repositories keep the parameters they were created with.
    pub kdf: KdfParams,
}

impl StorageConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cairn").join("config.json"))
    }

    /// Load configuration the way the CLI does.
    ///
    /// An explicitly named file must exist. Without one, the default file is
    /// read if present. Environment overrides apply in both cases.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.with_env_overrides()
    }

    /// Apply `CAIRN_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(passphrase) = lookup(PASSPHRASE_ENV) {
            self.crypt.passphrase = Some(Passphrase::new(passphrase));
        }
        if let Some(ttl) = lookup(LOCK_TTL_ENV) {
            self.lock.ttl_secs = ttl.trim().parse().map_err(|e| {
                Error::Config(format!("{} must be a number of seconds: {}", LOCK_TTL_ENV, e))
            })?;
        }
        Ok(self)
    }
}
