//! Object storage backends for raw uploads and persisted reports.
//!
//! The pipeline treats object storage as a flat blob namespace behind the
//! [`ObjectStore`] trait. Production deployments plug in their bucket
//! client; the in-memory and filesystem backends here serve tests and
//! single-node setups.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not (or does not yet) exist. Uploads race with the
    /// ingest tier's storage write, so callers treat this as retryable
    /// once before declaring the upload lost.
    #[error("no object at {path}")]
    NotFound { path: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat blob storage.
pub trait ObjectStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> Result<bool>;
}

/// Path for a raw upload moved out of the KV store into stable storage.
/// The layout matches what the ingest tier writes directly.
pub fn raw_upload_path(
    date: DateTime<Utc>,
    repo_hash: &str,
    commit_sha: &str,
    report_id: &str,
) -> String {
    format!(
        "v4/raw/{}/{}/{}/{}.txt",
        date.format("%Y-%m-%d"),
        repo_hash,
        commit_sha,
        report_id
    )
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().map_err(|e| StorageError::Backend(e.to_string()))?;
        blobs.get(path).cloned().ok_or_else(|| StorageError::NotFound {
            path: path.to_string(),
        })
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().map_err(|e| StorageError::Backend(e.to_string()))?;
        blobs.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().map_err(|e| StorageError::Backend(e.to_string()))?;
        blobs.remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let blobs = self.blobs.lock().map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(blobs.contains_key(path))
    }
}

/// Filesystem backend rooted at a base directory.
pub struct FileStorage {
    base: PathBuf,
}

impl FileStorage {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

impl ObjectStore for FileStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path);
        match std::fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(StorageError::Backend(format!(
                "failed to read {}: {e}",
                full.display()
            ))),
        }
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Backend(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&full, data).map_err(|e| {
            StorageError::Backend(format!("failed to write {}: {e}", full.display()))
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Backend(format!(
                "failed to delete {}: {e}",
                full.display()
            ))),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }
}
