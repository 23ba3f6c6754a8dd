use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::Result;

// Blob names mirror the original persisted layout, one document per key.
pub const USERS_KEY: &str = "users";
pub const LIBRARIES_KEY: &str = "libraries";
pub const TICKETS_KEY: &str = "tickets";
pub const SITE_SETTINGS_KEY: &str = "siteSettings";
pub const SOCIAL_LINKS_KEY: &str = "socialLinks";

/// Key-value blob storage. Writes are last-write-wins per key; there is
/// no versioning and no migration, the JSON documents are the format.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Disk-backed store, one `<key>.json` per blob under the data directory.
/// A content hash per key lets unchanged write-throughs skip the disk.
pub struct FileStore {
    storage_path: PathBuf,
    hashes: RwLock<HashMap<String, String>>,
}

impl FileStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let storage_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        Ok(FileStore {
            storage_path,
            hashes: RwLock::new(HashMap::new()),
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{key}.json"))
    }

    fn digest(value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl BlobStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.blob_path(key)).await {
            Ok(contents) => {
                let mut hashes = self.hashes.write().await;
                hashes.insert(key.to_string(), Self::digest(&contents));
                Ok(Some(contents))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let digest = Self::digest(value);
        let mut hashes = self.hashes.write().await;
        if hashes.get(key) == Some(&digest) {
            return Ok(());
        }

        fs::write(self.blob_path(key), value).await?;
        hashes.insert(key.to_string(), digest);
        Ok(())
    }
}
