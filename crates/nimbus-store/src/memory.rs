//! Transient in-process backend.
//!
//! Holds blobs in a concurrent map. Fills the same role the original
//! system's transient driver did: a zero-dependency backend for tests,
//! benchmarks and demo configurations. Contents vanish with the process.

use crate::backend::{BackendResult, BackendStore};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use nimbus_common::BackendId;

/// In-memory backend over a concurrent hash map.
pub struct MemoryBackend {
    id: BackendId,
    cost: u32,
    blobs: DashMap<String, Bytes>,
}

impl MemoryBackend {
    /// Create an empty memory backend.
    #[must_use]
    pub fn new(id: BackendId, cost: u32) -> Self {
        Self {
            id,
            cost,
            blobs: DashMap::new(),
        }
    }

    /// Number of blobs currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the backend holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BackendStore for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.blobs.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        Ok(self.blobs.iter().map(|entry| entry.key().clone()).collect())
    }
}
