//! Identity types the storage contract is keyed by.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one physical chunk part.
///
/// A logical chunk is named by its checksum and may be split into
/// `total_parts` stored objects. Construction validates the identity, so a
/// `ChunkId` in hand always satisfies `part < total_parts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    checksum: String,
    part: u32,
    total_parts: u32,
}

impl ChunkId {
    /// Create a chunk identity.
    ///
    /// # Errors
    /// - Checksum is empty or contains anything but ASCII alphanumerics
    /// - `total_parts` is zero
    /// - `part` is not below `total_parts`
    pub fn new(checksum: impl Into<String>, part: u32, total_parts: u32) -> crate::Result<Self> {
        let checksum = checksum.into();
        if checksum.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Chunk checksum cannot be empty".to_string(),
            ));
        }
        if !checksum.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(crate::Error::InvalidInput(format!(
                "Chunk checksum must be alphanumeric: {}",
                checksum
            )));
        }
        if total_parts == 0 {
            return Err(crate::Error::InvalidInput(
                "Chunk must have at least one part".to_string(),
            ));
        }
        if part >= total_parts {
            return Err(crate::Error::InvalidInput(format!(
                "Chunk part {} out of range for {} parts",
                part, total_parts
            )));
        }
        Ok(Self {
            checksum,
            part,
            total_parts,
        })
    }

    /// Identity of a chunk stored as a single part.
    pub fn single(checksum: impl Into<String>) -> crate::Result<Self> {
        Self::new(checksum, 0, 1)
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn part(&self) -> u32 {
        self.part
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}_{}", self.checksum, self.part, self.total_parts)
    }
}

/// Identifier of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Create a snapshot id.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains characters other than
    ///   ASCII alphanumerics, `-` and `_`
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "SnapshotId cannot be empty".to_string(),
            ));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(crate::Error::InvalidInput(format!(
                "SnapshotId contains invalid characters: {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque proof of repository lock ownership.
///
/// Produced by a backend when a lock is granted and presented back to renew
/// it. Callers never look inside.
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(Vec<u8>);

impl LockToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken([{} bytes])", self.0.len())
    }
}
