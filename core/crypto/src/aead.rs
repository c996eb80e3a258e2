//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use cairn_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Seal plaintext, binding it to `aad`.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - The nonce is randomly generated
/// - Output length is plaintext length + NONCE_SIZE + TAG_SIZE
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if encryption fails
///
/// # Security
/// - `aad` is authenticated but not encrypted; opening with different
///   associated data fails
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Open a sealed blob produced by [`seal`] with the same `aad`.
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if the blob is shorter than NONCE_SIZE + TAG_SIZE
/// - Returns error if authentication fails (tampered data, wrong key or
///   wrong associated data)
pub fn open(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = sealed.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, Payload { msg: encrypted, aad })
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Hello, World!";

        let ciphertext = seal(&key, plaintext, b"").unwrap();
        let decrypted = open(&key, &ciphertext, b"").unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_ciphertext_size() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        let ciphertext = seal(&key, plaintext, b"").unwrap();

        assert_eq!(ciphertext.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Same plaintext";

        let ct1 = seal(&key, plaintext, b"").unwrap();
        let ct2 = seal(&key, plaintext, b"").unwrap();

        assert_ne!(&ct1[..NONCE_SIZE], &ct2[..NONCE_SIZE]);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = [1u8; KEY_LENGTH];
        let key2 = [2u8; KEY_LENGTH];

        let ciphertext = seal(&key1, b"Secret data", b"").unwrap();
        assert!(open(&key2, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];

        let mut ciphertext = seal(&key, b"Important data", b"").unwrap();
        ciphertext[NONCE_SIZE + 5] ^= 0xFF;

        assert!(open(&key, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_associated_data_must_match() {
        let key = [7u8; KEY_LENGTH];

        let sealed = seal(&key, b"chunk body", b"chunk:aa.0_1").unwrap();
        assert_eq!(open(&key, &sealed, b"chunk:aa.0_1").unwrap(), b"chunk body");
        assert!(open(&key, &sealed, b"chunk:bb.0_1").is_err());
        assert!(open(&key, &sealed, b"").is_err());
    }

    #[test]
    fn test_short_blob_fails() {
        let key = [42u8; KEY_LENGTH];
        assert!(open(&key, &[0u8; NONCE_SIZE], b"").is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = [0u8; 16];
        assert!(seal(&short_key, b"data", b"").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_LENGTH];

        let ciphertext = seal(&key, b"", b"").unwrap();
        let decrypted = open(&key, &ciphertext, b"").unwrap();

        assert!(decrypted.is_empty());
    }
}
