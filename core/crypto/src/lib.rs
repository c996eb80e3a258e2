//! Cryptographic primitives for Cairn.
//!
//! This crate provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305, optionally bound to
//!   associated data
//! - Key types with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext, passphrase or key material is ever logged

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{open, seal, NONCE_SIZE, TAG_SIZE};
pub use kdf::{derive_key, KdfParams};
pub use keys::{MasterKey, Passphrase, Salt, SubKey, KEY_LENGTH};
