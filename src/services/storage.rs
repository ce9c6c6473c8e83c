use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

use crate::services::encryption::EncryptionError;

/// Blob storage for uploads, stage intermediates and captioned outputs.
///
/// Locators are opaque to callers; each backend only accepts its own.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `bytes` under `key`, overwriting any previous object.
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError>;

    /// Locator `store` returns for `key`, for objects found by well-known key.
    fn locator(&self, key: &str) -> String;

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove an object. Deleting a missing object succeeds.
    async fn delete(&self, locator: &str) -> Result<(), StorageError>;

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Storage key for an artifact written by `stage` of job `job_id`.
pub fn stage_key(job_id: uuid::Uuid, stage: &str, name: &str) -> String {
    format!("jobs/{}/{}/{}", job_id, stage, name)
}

/// Storage key for a transcript shared between processes.
pub fn transcript_key(fingerprint: &str) -> String {
    format!("transcripts/{}.json", fingerprint)
}

/// Storage key for an uploaded source video.
pub fn upload_key(upload_id: uuid::Uuid, filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("uploads/{}/{}", upload_id, sanitized.trim_start_matches('.'))
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Storage {
    bucket: Box<Bucket>,
}

const R2_SCHEME: &str = "r2://";

impl R2Storage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn key_of<'a>(&self, locator: &'a str) -> Result<&'a str, StorageError> {
        locator
            .strip_prefix(R2_SCHEME)
            .and_then(|rest| rest.strip_prefix(self.bucket.name.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| StorageError::InvalidLocator(locator.to_string()))
    }
}

#[async_trait]
impl Storage for R2Storage {
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, bytes, "application/octet-stream")
            .await?;
        check_status(response.status_code(), key)?;
        Ok(self.locator(key))
    }

    fn locator(&self, key: &str) -> String {
        format!("{}{}/{}", R2_SCHEME, self.bucket.name, key)
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_of(locator)?;
        let response = self.bucket.get_object(key).await?;
        check_status(response.status_code(), key)?;
        Ok(response.to_vec())
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let key = self.key_of(locator)?;
        let response = self.bucket.delete_object(key).await?;
        match response.status_code() {
            404 => Ok(()),
            code => check_status(code, key),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.bucket.head_object("health").await.map(|_| ()).or_else(|e| match e {
            s3::error::S3Error::HttpFailWithBody(404, _) => Ok(()),
            other => Err(StorageError::S3(other)),
        })
    }
}

fn check_status(code: u16, key: &str) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            code,
            key: key.to_string(),
        }),
    }
}

/// Filesystem storage rooted at a directory, for single-node deployments.
pub struct LocalStorage {
    root: PathBuf,
}

const LOCAL_SCHEME: &str = "local:";

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::InvalidLocator(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn key_of<'a>(&self, locator: &'a str) -> Result<&'a str, StorageError> {
        locator
            .strip_prefix(LOCAL_SCHEME)
            .ok_or_else(|| StorageError::InvalidLocator(locator.to_string()))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Rename over the target so readers never see a half-written object.
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = path.with_file_name(format!("{}.{}.partial", name, uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &path).await?;
        Ok(self.locator(key))
    }

    fn locator(&self, key: &str) -> String {
        format!("{}{}", LOCAL_SCHEME, key)
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_of(locator)?;
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let key = self.key_of(locator)?;
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

/// In-process storage used for development and tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

const MEMORY_SCHEME: &str = "mem:";

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held, in lexical order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn key_of<'a>(locator: &'a str) -> Result<&'a str, StorageError> {
        locator
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| StorageError::InvalidLocator(locator.to_string()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(self.locator(key))
    }

    fn locator(&self, key: &str) -> String {
        format!("{}{}", MEMORY_SCHEME, key)
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::key_of(locator)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let key = Self::key_of(locator)?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned status {code} for '{key}'")]
    Status { code: u16, key: String },

    #[error("Filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Locator not understood by this backend: {0}")]
    InvalidLocator(String),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Artifact encryption failed: {0}")]
    Encryption(#[from] EncryptionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_overwrites_and_deletes() {
        let storage = MemoryStorage::new();
        let locator = storage.store(b"first", "jobs/a/x").await.unwrap();
        let again = storage.store(b"second", "jobs/a/x").await.unwrap();
        assert_eq!(locator, again);
        assert_eq!(storage.fetch(&locator).await.unwrap(), b"second");

        storage.delete(&locator).await.unwrap();
        storage.delete(&locator).await.unwrap();
        assert!(matches!(
            storage.fetch(&locator).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let root = std::env::temp_dir().join(format!("caption-storage-{}", uuid::Uuid::new_v4()));
        let storage = LocalStorage::new(&root);
        let locator = storage.store(b"pcm", "jobs/j/extracting_audio/audio.wav").await.unwrap();
        assert_eq!(locator, "local:jobs/j/extracting_audio/audio.wav");
        assert_eq!(storage.fetch(&locator).await.unwrap(), b"pcm");
        storage.delete(&locator).await.unwrap();
        assert!(storage.fetch(&locator).await.is_err());
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn concurrent_local_writes_to_one_key_leave_a_whole_object() {
        let root = std::env::temp_dir().join(format!("caption-storage-{}", uuid::Uuid::new_v4()));
        let storage = std::sync::Arc::new(LocalStorage::new(&root));
        let key = "transcripts/fp.json";

        let writers: Vec<_> = (0..8u8)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.store(&vec![i; 64 * 1024], key).await })
            })
            .collect();
        for writer in futures::future::join_all(writers).await {
            writer.unwrap().unwrap();
        }

        let bytes = storage.fetch(&storage.locator(key)).await.unwrap();
        assert_eq!(bytes.len(), 64 * 1024);
        assert!(bytes.iter().all(|b| *b == bytes[0]));

        let mut leftovers = tokio::fs::read_dir(root.join("transcripts")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["fp.json".to_string()]);
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_keys() {
        let storage = LocalStorage::new(std::env::temp_dir());
        assert!(matches!(
            storage.store(b"x", "../etc/passwd").await,
            Err(StorageError::InvalidLocator(_))
        ));
        assert!(matches!(
            storage.fetch("mem:foo").await,
            Err(StorageError::InvalidLocator(_))
        ));
    }

    #[test]
    fn upload_keys_are_sanitized() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            upload_key(id, "../my clip.mp4"),
            format!("uploads/{}/_my_clip.mp4", id)
        );
    }
}
