//! Snapshot files
//!
//! Each repository keeps one versioned JSON snapshot under `.storage/`:
//!
//! ```json
//! { "version": 1, "minor_version": 1, "key": "hub.entities", "data": [] }
//! ```
//!
//! Snapshots written by a newer major version are refused; minor bumps are
//! read as is.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

use crate::{StorageError, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// A `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Read the snapshot for `key`, `None` before the first save
    pub async fn load<T>(&self, key: &str, supported: u32) -> StorageResult<Option<StorageFile<T>>>
    where
        T: DeserializeOwned,
    {
        let raw = match fs::read(self.file_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                trace!(key, "No snapshot yet");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let file: StorageFile<T> = serde_json::from_slice(&raw)?;
        if file.version > supported {
            return Err(StorageError::UnsupportedVersion {
                key: key.to_string(),
                found: file.version,
                supported,
            });
        }
        debug!(key, version = file.version, minor = file.minor_version, "Snapshot loaded");
        Ok(Some(file))
    }

    /// Replace the snapshot; readers never see a half written file
    pub async fn save<T>(&self, file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        self.ensure_dir().await?;
        let target = self.file_path(&file.key);
        let staging = self.file_path(&format!("{}.tmp", file.key));
        fs::write(&staging, serde_json::to_vec_pretty(file)?).await?;
        fs::rename(&staging, &target).await?;
        trace!(key = %file.key, "Snapshot saved");
        Ok(())
    }
}
