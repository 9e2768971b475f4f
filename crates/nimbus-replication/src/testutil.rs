//! Shared fixtures for protocol tests: a failure-injecting backend and a
//! metadata wrapper that deterministically loses a publish race.

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_common::{
    BackendError, BackendId, ClientId, MetadataRecord, OrphanMarker, StaleMarker, Version,
};
use nimbus_meta::{MemoryMetadataService, MetaResult, MetadataService, PublishOutcome};
use nimbus_store::{BackendPool, BackendResult, BackendStore, MemoryBackend};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn client(id: &str) -> ClientId {
    ClientId::new(id).unwrap()
}

/// Pool of `n` memory backends named `b0..bn`, cheapest first.
pub fn mem_pool(n: usize) -> Arc<BackendPool> {
    let stores: Vec<Arc<dyn BackendStore>> = (0..n)
        .map(|i| {
            Arc::new(MemoryBackend::new(BackendId::new(format!("b{i}")), i as u32))
                as Arc<dyn BackendStore>
        })
        .collect();
    Arc::new(BackendPool::new(stores))
}

/// Memory backend with switchable put/get failures.
pub struct FlakyBackend {
    inner: MemoryBackend,
    pub fail_puts: AtomicBool,
    pub fail_gets: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl FlakyBackend {
    pub fn new(id: &str) -> Self {
        Self {
            inner: MemoryBackend::new(BackendId::new(id), 0),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn failing_puts(id: &str) -> Self {
        let backend = Self::new(id);
        backend.fail_puts.store(true, Ordering::SeqCst);
        backend
    }
}

#[async_trait]
impl BackendStore for FlakyBackend {
    fn id(&self) -> &BackendId {
        self.inner.id()
    }

    fn cost(&self) -> u32 {
        self.inner.cost()
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("injected put failure"));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("injected get failure"));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("injected delete failure"));
        }
        self.inner.delete(key).await
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        self.inner.list().await
    }
}

/// Metadata wrapper that publishes a rival record just before the first
/// publish that goes through it, reproducing a lost race without timing.
pub struct RacingMeta {
    inner: MemoryMetadataService,
    rival: Mutex<Option<(String, MetadataRecord)>>,
}

impl RacingMeta {
    pub fn new() -> Self {
        Self {
            inner: MemoryMetadataService::new(),
            rival: Mutex::new(None),
        }
    }

    pub fn install_rival(&self, key: &str, record: MetadataRecord) {
        *self.rival.lock() = Some((key.to_string(), record));
    }
}

#[async_trait]
impl MetadataService for RacingMeta {
    async fn lookup(&self, key: &str) -> MetaResult<Option<MetadataRecord>> {
        self.inner.lookup(key).await
    }

    async fn conditional_publish(
        &self,
        key: &str,
        record: MetadataRecord,
        expected_prev: Option<Version>,
    ) -> MetaResult<PublishOutcome> {
        let rival_entry = self.rival.lock().take();
        if let Some((rival_key, rival)) = rival_entry {
            let outcome = self.inner.conditional_publish(&rival_key, rival, None).await?;
            assert!(matches!(outcome, PublishOutcome::Published { .. }));
        }
        self.inner.conditional_publish(key, record, expected_prev).await
    }

    async fn remove(&self, key: &str, expected: &Version) -> MetaResult<bool> {
        self.inner.remove(key, expected).await
    }

    async fn mark_stale(&self, marker: StaleMarker) -> MetaResult<()> {
        self.inner.mark_stale(marker).await
    }

    async fn mark_orphan(&self, marker: OrphanMarker) -> MetaResult<()> {
        self.inner.mark_orphan(marker).await
    }

    async fn list_stale(&self) -> MetaResult<Vec<StaleMarker>> {
        self.inner.list_stale().await
    }

    async fn list_orphans(&self) -> MetaResult<Vec<OrphanMarker>> {
        self.inner.list_orphans().await
    }

    async fn remove_stale_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.inner.remove_stale_marker(key, version).await
    }

    async fn remove_orphan_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.inner.remove_orphan_marker(key, version).await
    }

    async fn list_keys(&self) -> MetaResult<Vec<String>> {
        self.inner.list_keys().await
    }
}
