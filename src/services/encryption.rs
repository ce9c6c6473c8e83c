use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, AeadCore, Nonce};
use async_trait::async_trait;
use base64::Engine;

use crate::services::storage::{Storage, StorageError};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Leading bytes of every sealed object: format tag then nonce.
const SEAL_TAG: &[u8; 4] = b"CPv1";

/// AES-256-GCM cipher for uploaded videos and stage artifacts at rest.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Build from the base64 form of a 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Seal `plaintext` as `tag || nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(SEAL_TAG.len() + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(SEAL_TAG);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let body = sealed
            .strip_prefix(SEAL_TAG.as_slice())
            .ok_or(EncryptionError::NotSealed)?;
        if body.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

/// Storage decorator that encrypts every object before it leaves the process.
pub struct EncryptedStorage<S> {
    inner: S,
    encryption: EncryptionService,
}

impl<S: Storage> EncryptedStorage<S> {
    pub fn new(inner: S, encryption: EncryptionService) -> Self {
        Self { inner, encryption }
    }
}

#[async_trait]
impl<S: Storage> Storage for EncryptedStorage<S> {
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let sealed = self.encryption.encrypt(bytes)?;
        self.inner.store(&sealed, key).await
    }

    fn locator(&self, key: &str) -> String {
        self.inner.locator(key)
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let sealed = self.inner.fetch(locator).await?;
        Ok(self.encryption.decrypt(&sealed)?)
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        self.inner.delete(locator).await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.inner.health_check().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Object was not written by encrypted storage")]
    NotSealed,
}
