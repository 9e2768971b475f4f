//! Local-directory backend.
//!
//! Stores each blob as one file under a root directory. Physical keys are
//! hex-encoded into file names because backend keys contain characters
//! (`#`, `/`) that are not path-safe.

use crate::backend::{BackendResult, BackendStore};
use async_trait::async_trait;
use bytes::Bytes;
use nimbus_common::{BackendError, BackendId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Filesystem backend rooted at one directory.
pub struct FsBackend {
    id: BackendId,
    cost: u32,
    root: PathBuf,
}

impl FsBackend {
    /// Open the backend, creating the root directory if needed.
    pub async fn open(
        id: BackendId,
        cost: u32,
        root: impl Into<PathBuf>,
    ) -> BackendResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(map_io)?;
        Ok(Self { id, cost, root })
    }

    /// Root directory holding this backend's blobs.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }
}

fn map_io(e: std::io::Error) -> BackendError {
    if e.kind() == ErrorKind::PermissionDenied {
        BackendError::Unauthorized(e.to_string())
    } else {
        BackendError::Io(e)
    }
}

#[async_trait]
impl BackendStore for FsBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        tokio::fs::write(self.path_for(key), &data)
            .await
            .map_err(map_io)
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(map_io)?;
        while let Some(entry) = entries.next_entry().await.map_err(map_io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Foreign files in the root directory are ignored.
            if let Ok(raw) = hex::decode(name)
                && let Ok(key) = String::from_utf8(raw)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
