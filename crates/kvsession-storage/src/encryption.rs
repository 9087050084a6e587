//! AES-256-GCM encryption for session payloads
//!
//! Ciphertext layout: 12-byte random nonce followed by the sealed payload.

use crate::traits::{StorageError, StorageResult};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use std::fmt;

/// Key length in bytes
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Symmetric key used to seal session payloads
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey([u8; KEY_LEN]);

impl CryptoKey {
    /// Build a key from exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            StorageError::Config(format!(
                "Crypto key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    pub fn encrypt(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        let cipher = Aes256Gcm::new((&self.0).into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| StorageError::Serialization(format!("Encryption error: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, encrypted: &[u8]) -> StorageResult<Vec<u8>> {
        if encrypted.len() < NONCE_LEN {
            return Err(StorageError::InvalidData(
                "Encrypted data too short".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new((&self.0).into());
        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StorageError::InvalidData(format!("Decryption error: {}", e)))
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey(..)")
    }
}
