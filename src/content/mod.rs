//! Content Store
//!
//! Content-addressed file persistence keyed by the lowercase hex SHA-256
//! of the bytes. Records reference content by hash; the store is what
//! sync fetches into.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Content-addressed storage used by the sync protocol
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Whether content for the hash is present
    async fn has(&self, hash: &str) -> Result<bool>;

    /// Read content by hash
    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    /// Store content and return its hash
    async fn put(&self, data: &[u8]) -> Result<String>;

    /// Store content fetched from a peer, rejecting bytes that do not match the hash
    async fn put_verified(&self, hash: &str, data: &[u8]) -> Result<()>;
}

/// Hex SHA-256 of a byte slice
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether a string is a well-formed content hash
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Filesystem content store sharded by hash prefix
pub struct FsContentStore {
    base_dir: PathBuf,
}

impl FsContentStore {
    /// Create a new content store
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Get the path for content by its hash
    fn content_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            return Err(Error::ContentNotFound(format!("invalid content hash {}", hash)));
        }
        // First 2 characters as subdirectory keep directories small
        Ok(self.base_dir.join(&hash[0..2]).join(&hash[2..]))
    }

    async fn write(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.content_path(hash)?;
        if tokio::fs::try_exists(&path).await? {
            debug!("Content {} already exists (deduplicated)", hash);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temp file then rename so readers never see partial content
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored content {} ({} bytes)", hash, data.len());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContentStore for FsContentStore {
    async fn has(&self, hash: &str) -> Result<bool> {
        let path = self.content_path(hash)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.content_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, data: &[u8]) -> Result<String> {
        let hash = content_hash(data);
        self.write(&hash, data).await?;
        Ok(hash)
    }

    async fn put_verified(&self, hash: &str, data: &[u8]) -> Result<()> {
        let actual = content_hash(data);
        if actual != hash {
            return Err(Error::ContentHashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        self.write(hash, data).await
    }
}
