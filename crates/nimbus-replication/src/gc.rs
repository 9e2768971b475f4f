//! Garbage collection of superseded and orphaned data.
//!
//! The collector consumes the metadata service's stale/orphan bookkeeping
//! and issues deletes through the backend pool. Per marker it always
//! deletes the backend replicas first and the marker second, so a crash
//! mid-collection leaves a retryable marker rather than unreferenced blobs.
//! It shares no locks with the read/write path and is safe to run
//! alongside it: only explicitly marked versions, or keys absent from
//! every live and bookkeeping reference, are ever deleted.

use nimbus_common::{BackendId, BackendKey, Result, Version};
use nimbus_meta::MetadataService;
use nimbus_store::BackendPool;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tally of one collection run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Backend replicas deleted through markers.
    pub blobs_deleted: usize,
    /// Stale/orphan markers fully collected and removed.
    pub markers_removed: usize,
    /// Unreferenced backend keys deleted by the full-sweep cross-reference.
    pub unreferenced_deleted: usize,
    /// Individual deletes that failed; their markers were retained for the
    /// next run.
    pub failures: usize,
}

impl GcReport {
    /// Whether the run changed nothing and hit no failures.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.blobs_deleted == 0
            && self.markers_removed == 0
            && self.unreferenced_deleted == 0
            && self.failures == 0
    }
}

/// Reclaims backend copies of versions that are no longer (or never were)
/// published.
pub struct GarbageCollector {
    pool: Arc<BackendPool>,
    meta: Arc<dyn MetadataService>,
}

impl GarbageCollector {
    /// Create a collector over the same pool and metadata service the
    /// engine uses.
    #[must_use]
    pub fn new(pool: Arc<BackendPool>, meta: Arc<dyn MetadataService>) -> Self {
        Self { pool, meta }
    }

    /// Targeted collection: reclaim everything the stale and orphan
    /// markers of `key` reference. The currently published version is
    /// never touched.
    pub async fn gc(&self, key: &str) -> Result<GcReport> {
        let mut report = GcReport::default();
        let current = self.meta.lookup(key).await?.map(|r| r.version);

        for marker in self.meta.list_stale().await? {
            if marker.key == key {
                self.collect_stale(&marker.key, &marker.version, &marker.replicas, current.as_ref(), &mut report)
                    .await?;
            }
        }
        for marker in self.meta.list_orphans().await? {
            if marker.key == key {
                self.collect_orphan(&marker.key, &marker.version, &marker.replicas, current.as_ref(), &mut report)
                    .await?;
            }
        }
        Ok(report)
    }

    /// Run the targeted pass for every key with pending bookkeeping.
    pub async fn gc_all(&self) -> Result<GcReport> {
        let mut keys = BTreeSet::new();
        for marker in self.meta.list_stale().await? {
            keys.insert(marker.key);
        }
        for marker in self.meta.list_orphans().await? {
            keys.insert(marker.key);
        }

        let mut report = GcReport::default();
        for key in keys {
            let partial = self.gc(&key).await?;
            report.blobs_deleted += partial.blobs_deleted;
            report.markers_removed += partial.markers_removed;
            report.failures += partial.failures;
        }
        info!(
            "gc pass: {} blobs deleted, {} markers removed, {} failures",
            report.blobs_deleted, report.markers_removed, report.failures
        );
        Ok(report)
    }

    /// Full sweep: the targeted pass for every key, then a cross-reference
    /// of each backend's raw listing against every live or bookkeeping
    /// reference. Backend keys referenced by neither — crash leftovers that
    /// never got a marker, or malformed foreign writes — are deleted
    /// outright. Per-key failures are logged and do not abort the sweep.
    pub async fn batch_gc(&self) -> Result<GcReport> {
        let mut report = self.gc_all().await?;

        // Snapshot the reference union before listing any backend, so a
        // write that lands later is seen by the listing only if its
        // version or marker is too.
        let mut referenced: HashSet<String> = HashSet::new();
        for key in self.meta.list_keys().await? {
            if let Some(record) = self.meta.lookup(&key).await? {
                referenced.insert(BackendKey::derive(&key, &record.version).as_str().to_owned());
            }
        }
        for marker in self.meta.list_stale().await? {
            referenced.insert(marker.backend_key().as_str().to_owned());
        }
        for marker in self.meta.list_orphans().await? {
            referenced.insert(marker.backend_key().as_str().to_owned());
        }

        for store in self.pool.stores() {
            let keys = match self.pool.list(store.as_ref()).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("sweep cannot list {}: {e}", store.id());
                    report.failures += 1;
                    continue;
                }
            };
            for key in keys {
                if referenced.contains(&key) {
                    continue;
                }
                debug!("sweeping unreferenced '{key}' from {}", store.id());
                match self.pool.delete(store.as_ref(), &key).await {
                    Ok(()) => report.unreferenced_deleted += 1,
                    Err(_) => report.failures += 1,
                }
            }
        }

        info!(
            "batch gc: {} blobs deleted, {} markers removed, {} unreferenced swept, {} failures",
            report.blobs_deleted,
            report.markers_removed,
            report.unreferenced_deleted,
            report.failures
        );
        Ok(report)
    }

    async fn collect_stale(
        &self,
        key: &str,
        version: &Version,
        replicas: &[BackendId],
        current: Option<&Version>,
        report: &mut GcReport,
    ) -> Result<()> {
        if self
            .delete_replicas(key, version, replicas, current, report)
            .await
        {
            self.meta.remove_stale_marker(key, version).await?;
            report.markers_removed += 1;
        }
        Ok(())
    }

    async fn collect_orphan(
        &self,
        key: &str,
        version: &Version,
        replicas: &[BackendId],
        current: Option<&Version>,
        report: &mut GcReport,
    ) -> Result<()> {
        if self
            .delete_replicas(key, version, replicas, current, report)
            .await
        {
            self.meta.remove_orphan_marker(key, version).await?;
            report.markers_removed += 1;
        }
        Ok(())
    }

    /// Delete one marked version from its listed replicas. Returns whether
    /// every replica was dealt with — only then may the marker go.
    async fn delete_replicas(
        &self,
        key: &str,
        version: &Version,
        replicas: &[BackendId],
        current: Option<&Version>,
        report: &mut GcReport,
    ) -> bool {
        if current == Some(version) {
            // A marker naming the published version shows up mid-delete
            // (stale marked, pointer not yet removed). Leave it alone.
            debug!("marker for '{key}' names the published version {version}, skipping");
            return false;
        }
        let backend_key = BackendKey::derive(key, version);
        let mut complete = true;
        for id in replicas {
            let Some(store) = self.pool.store(id) else {
                warn!("marker for '{key}' names unconfigured backend {id}");
                report.failures += 1;
                complete = false;
                continue;
            };
            match self.pool.delete(store.as_ref(), backend_key.as_str()).await {
                Ok(()) => report.blobs_deleted += 1,
                Err(_) => {
                    // Logged by the pool. Marker stays for the next run.
                    report.failures += 1;
                    complete = false;
                }
            }
        }
        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReplicationEngine;
    use crate::testutil::{FlakyBackend, client, mem_pool};
    use bytes::Bytes;
    use nimbus_common::OrphanMarker;
    use nimbus_common::config::ReplicationConfig;
    use nimbus_meta::MemoryMetadataService;
    use nimbus_store::{BackendStore, MemoryBackend};

    /// Engine writing to all three backends so replica sets are
    /// deterministic in the assertions below.
    fn engine_over(
        pool: &Arc<BackendPool>,
        meta: &Arc<MemoryMetadataService>,
    ) -> ReplicationEngine {
        ReplicationEngine::new(
            Arc::clone(pool),
            Arc::clone(meta) as Arc<dyn MetadataService>,
            client("w1"),
            ReplicationConfig {
                width: 3,
                quorum: Some(3),
            },
        )
    }

    fn collector(
        pool: &Arc<BackendPool>,
        meta: &Arc<MemoryMetadataService>,
    ) -> GarbageCollector {
        GarbageCollector::new(
            Arc::clone(pool),
            Arc::clone(meta) as Arc<dyn MetadataService>,
        )
    }

    async fn assert_absent_everywhere(pool: &BackendPool, backend_key: &BackendKey) {
        for store in pool.stores() {
            assert_eq!(
                store.get(backend_key.as_str()).await.unwrap(),
                None,
                "{} still holds {backend_key}",
                store.id()
            );
        }
    }

    #[tokio::test]
    async fn gc_key_reclaims_superseded_versions_only() {
        let pool = mem_pool(3);
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        let v1 = engine.put("k", Bytes::from_static(b"v1")).await.unwrap();
        let v2 = engine.put("k", Bytes::from_static(b"v2")).await.unwrap();
        engine.put("k", Bytes::from_static(b"v3")).await.unwrap();

        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.markers_removed, 2);
        assert_eq!(report.blobs_deleted, 6);
        assert_eq!(report.failures, 0);

        // Superseded versions are unreachable on every backend.
        assert_absent_everywhere(&pool, &BackendKey::derive("k", &v1)).await;
        assert_absent_everywhere(&pool, &BackendKey::derive("k", &v2)).await;

        // The published version is untouched.
        assert_eq!(
            engine.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v3"))
        );
        assert!(meta.list_stale().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_twice_is_idempotent() {
        let pool = mem_pool(3);
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        engine.put("k", Bytes::from_static(b"v1")).await.unwrap();
        engine.put("k", Bytes::from_static(b"v2")).await.unwrap();

        let first = gc.gc_all().await.unwrap();
        assert!(first.markers_removed > 0);

        let second = gc.gc_all().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(
            engine.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn gc_collects_orphans_without_touching_winner() {
        let pool = mem_pool(3);
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        engine.put("k", Bytes::from_static(b"published")).await.unwrap();

        // A loser's replicas, marked but never published.
        let orphan_version = Version::new(1, client("loser"));
        let orphan_key = BackendKey::derive("k", &orphan_version);
        let replicas: Vec<BackendId> = pool.stores()[..2]
            .iter()
            .map(|s| s.id().clone())
            .collect();
        for store in &pool.stores()[..2] {
            store
                .put(orphan_key.as_str(), Bytes::from_static(b"never seen"))
                .await
                .unwrap();
        }
        meta.mark_orphan(OrphanMarker {
            key: "k".into(),
            version: orphan_version,
            replicas,
        })
        .await
        .unwrap();

        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.blobs_deleted, 2);
        assert_eq!(report.markers_removed, 1);

        assert_absent_everywhere(&pool, &orphan_key).await;
        assert!(meta.list_orphans().await.unwrap().is_empty());
        assert_eq!(
            engine.get("k").await.unwrap(),
            Some(Bytes::from_static(b"published"))
        );
    }

    #[tokio::test]
    async fn batch_gc_full_scenario() {
        let pool = mem_pool(3);
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        // Unreferenced junk with no marker at all: foreign writes, and a
        // fabricated version a crashed writer never got to mark.
        pool.stores()[0]
            .put("malformedkey1", Bytes::from_static(b"junk1"))
            .await
            .unwrap();
        pool.stores()[1]
            .put("malformedkey2", Bytes::from_static(b"junk2"))
            .await
            .unwrap();
        let ghost_key = BackendKey::derive("key4", &Version::new(7, client("ghost")));
        for store in &pool.stores()[..2] {
            store
                .put(ghost_key.as_str(), Bytes::from_static(b"unmarked"))
                .await
                .unwrap();
        }

        // Stale versions.
        let k1v1 = engine.put("key1", Bytes::from_static(b"a1")).await.unwrap();
        let k1v2 = engine.put("key1", Bytes::from_static(b"a2")).await.unwrap();
        let k1v3 = engine.put("key1", Bytes::from_static(b"a3")).await.unwrap();
        let k2v1 = engine.put("key2", Bytes::from_static(b"b1")).await.unwrap();
        let k2v2 = engine.put("key2", Bytes::from_static(b"b2")).await.unwrap();

        // A marked orphan of a key that was never published.
        let orphan_version = Version::new(1, client("fab"));
        let orphan_key = BackendKey::derive("key3", &orphan_version);
        let orphan_replicas: Vec<BackendId> = pool.stores()[..2]
            .iter()
            .map(|s| s.id().clone())
            .collect();
        for store in &pool.stores()[..2] {
            store
                .put(orphan_key.as_str(), Bytes::from_static(b"b6"))
                .await
                .unwrap();
        }
        meta.mark_orphan(OrphanMarker {
            key: "key3".into(),
            version: orphan_version,
            replicas: orphan_replicas,
        })
        .await
        .unwrap();

        let report = gc.batch_gc().await.unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(report.unreferenced_deleted, 4);

        // Junk, stales and orphans are gone everywhere.
        assert_eq!(pool.stores()[0].get("malformedkey1").await.unwrap(), None);
        assert_eq!(pool.stores()[1].get("malformedkey2").await.unwrap(), None);
        assert_absent_everywhere(&pool, &ghost_key).await;
        assert_absent_everywhere(&pool, &BackendKey::derive("key1", &k1v1)).await;
        assert_absent_everywhere(&pool, &BackendKey::derive("key1", &k1v2)).await;
        assert_absent_everywhere(&pool, &BackendKey::derive("key2", &k2v1)).await;
        assert_absent_everywhere(&pool, &orphan_key).await;
        assert!(meta.list_stale().await.unwrap().is_empty());
        assert!(meta.list_orphans().await.unwrap().is_empty());

        // Published versions survive.
        assert_eq!(
            engine.get("key1").await.unwrap(),
            Some(Bytes::from_static(b"a3"))
        );
        assert_eq!(
            engine.get("key2").await.unwrap(),
            Some(Bytes::from_static(b"b2"))
        );
        assert_eq!(engine.get("key3").await.unwrap(), None);

        // Completeness: every remaining backend key is referenced by a
        // current record.
        let live: Vec<String> = vec![
            BackendKey::derive("key1", &k1v3).as_str().to_owned(),
            BackendKey::derive("key2", &k2v2).as_str().to_owned(),
        ];
        for store in pool.stores() {
            for key in store.list().await.unwrap() {
                assert!(live.contains(&key), "unreferenced '{key}' survived the sweep");
            }
        }

        // A second sweep has nothing left to do.
        assert!(gc.batch_gc().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn failed_delete_retains_marker_for_next_run() {
        let flaky = Arc::new(FlakyBackend::new("f0"));
        let stores: Vec<Arc<dyn BackendStore>> = vec![
            Arc::clone(&flaky) as Arc<dyn BackendStore>,
            Arc::new(MemoryBackend::new(BackendId::new("m1"), 1)),
            Arc::new(MemoryBackend::new(BackendId::new("m2"), 2)),
        ];
        let pool = Arc::new(BackendPool::new(stores));
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        engine.put("k", Bytes::from_static(b"v1")).await.unwrap();
        engine.put("k", Bytes::from_static(b"v2")).await.unwrap();

        flaky
            .fail_deletes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.markers_removed, 0);
        assert_eq!(meta.list_stale().await.unwrap().len(), 1);

        // The next run finishes the job.
        flaky
            .fail_deletes
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(report.markers_removed, 1);
        assert!(meta.list_stale().await.unwrap().is_empty());
        assert_eq!(
            engine.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn marker_naming_published_version_is_skipped() {
        let pool = mem_pool(3);
        let meta = Arc::new(MemoryMetadataService::new());
        let engine = engine_over(&pool, &meta);
        let gc = collector(&pool, &meta);

        let version = engine.put("k", Bytes::from_static(b"v")).await.unwrap();
        let record = meta.lookup("k").await.unwrap().unwrap();

        // A delete crashed between marking and pointer removal: the marker
        // names the still-published version.
        meta.mark_stale(nimbus_common::StaleMarker {
            key: "k".into(),
            version: version.clone(),
            replicas: record.replicas,
        })
        .await
        .unwrap();

        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.blobs_deleted, 0);
        assert_eq!(report.markers_removed, 0);
        assert_eq!(meta.list_stale().await.unwrap().len(), 1);
        assert_eq!(
            engine.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );

        // Once the pointer is gone the marker is collectable.
        assert!(meta.remove("k", &version).await.unwrap());
        let report = gc.gc("k").await.unwrap();
        assert_eq!(report.markers_removed, 1);
        assert_eq!(engine.get("k").await.unwrap(), None);
    }
}
