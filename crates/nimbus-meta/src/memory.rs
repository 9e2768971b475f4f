//! In-memory metadata service.
//!
//! One mutex over the whole state; the conditional publish decision and
//! the install happen under the same lock, which is all the CAS the
//! protocol needs. Used by tests and transient demo configurations.

use crate::{MetaResult, MetadataService, PublishOutcome, supersedes};
use async_trait::async_trait;
use nimbus_common::{MetadataRecord, OrphanMarker, StaleMarker, Version};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Default)]
struct State {
    records: HashMap<String, MetadataRecord>,
    stale: BTreeMap<(String, Version), StaleMarker>,
    orphans: BTreeMap<(String, Version), OrphanMarker>,
}

/// Transient metadata service over in-process maps.
#[derive(Default)]
pub struct MemoryMetadataService {
    state: Mutex<State>,
}

impl MemoryMetadataService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataService for MemoryMetadataService {
    async fn lookup(&self, key: &str) -> MetaResult<Option<MetadataRecord>> {
        Ok(self.state.lock().records.get(key).cloned())
    }

    async fn conditional_publish(
        &self,
        key: &str,
        record: MetadataRecord,
        expected_prev: Option<Version>,
    ) -> MetaResult<PublishOutcome> {
        let mut state = self.state.lock();
        if let Some(current) = state.records.get(key)
            && !supersedes(&record.version, Some(&current.version))
        {
            return Ok(PublishOutcome::Conflict {
                current: current.clone(),
            });
        }
        let previous = state.records.insert(key.to_string(), record);
        if previous.as_ref().map(|r| &r.version) != expected_prev.as_ref() {
            debug!("publish for '{key}' replaced a record the publisher had not seen");
        }
        Ok(PublishOutcome::Published { previous })
    }

    async fn remove(&self, key: &str, expected: &Version) -> MetaResult<bool> {
        let mut state = self.state.lock();
        match state.records.get(key) {
            Some(record) if record.version == *expected => {
                state.records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_stale(&self, marker: StaleMarker) -> MetaResult<()> {
        self.state
            .lock()
            .stale
            .insert((marker.key.clone(), marker.version.clone()), marker);
        Ok(())
    }

    async fn mark_orphan(&self, marker: OrphanMarker) -> MetaResult<()> {
        self.state
            .lock()
            .orphans
            .insert((marker.key.clone(), marker.version.clone()), marker);
        Ok(())
    }

    async fn list_stale(&self) -> MetaResult<Vec<StaleMarker>> {
        Ok(self.state.lock().stale.values().cloned().collect())
    }

    async fn list_orphans(&self) -> MetaResult<Vec<OrphanMarker>> {
        Ok(self.state.lock().orphans.values().cloned().collect())
    }

    async fn remove_stale_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.state
            .lock()
            .stale
            .remove(&(key.to_string(), version.clone()));
        Ok(())
    }

    async fn remove_orphan_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.state
            .lock()
            .orphans
            .remove(&(key.to_string(), version.clone()));
        Ok(())
    }

    async fn list_keys(&self) -> MetaResult<Vec<String>> {
        Ok(self.state.lock().records.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{BackendId, ClientId, Digest};

    fn record(counter: u64, client: &str) -> MetadataRecord {
        MetadataRecord::new(
            Version::new(counter, ClientId::new(client).unwrap()),
            vec![BackendId::new("b1")],
            Digest::compute(b"data"),
            4,
        )
    }

    #[tokio::test]
    async fn publish_then_lookup() {
        let meta = MemoryMetadataService::new();
        let rec = record(0, "w1");
        let outcome = meta
            .conditional_publish("k", rec.clone(), None)
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published { previous: None });
        assert_eq!(meta.lookup("k").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn publish_returns_replaced_record() {
        let meta = MemoryMetadataService::new();
        let first = record(0, "w1");
        meta.conditional_publish("k", first.clone(), None)
            .await
            .unwrap();
        let outcome = meta
            .conditional_publish("k", record(1, "w1"), Some(first.version.clone()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                previous: Some(first)
            }
        );
    }

    #[tokio::test]
    async fn equal_or_lower_version_conflicts() {
        let meta = MemoryMetadataService::new();
        let current = record(5, "w2");
        meta.conditional_publish("k", current.clone(), None)
            .await
            .unwrap();

        for candidate in [record(5, "w2"), record(4, "w9")] {
            let outcome = meta
                .conditional_publish("k", candidate, None)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                PublishOutcome::Conflict {
                    current: current.clone()
                }
            );
        }
        // The stored record is untouched.
        assert_eq!(meta.lookup("k").await.unwrap(), Some(current));
    }

    #[tokio::test]
    async fn same_counter_higher_client_wins() {
        let meta = MemoryMetadataService::new();
        meta.conditional_publish("k", record(3, "aaa"), None)
            .await
            .unwrap();
        let outcome = meta
            .conditional_publish("k", record(3, "bbb"), None)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn remove_is_conditional_on_version() {
        let meta = MemoryMetadataService::new();
        let rec = record(2, "w1");
        meta.conditional_publish("k", rec.clone(), None)
            .await
            .unwrap();

        let newer = Version::new(3, ClientId::new("w1").unwrap());
        assert!(!meta.remove("k", &newer).await.unwrap());
        assert!(meta.lookup("k").await.unwrap().is_some());

        assert!(meta.remove("k", &rec.version).await.unwrap());
        assert_eq!(meta.lookup("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn marker_bookkeeping_round_trip() {
        let meta = MemoryMetadataService::new();
        let v = Version::new(1, ClientId::new("w1").unwrap());
        let stale = StaleMarker {
            key: "k".into(),
            version: v.clone(),
            replicas: vec![BackendId::new("b1")],
        };
        let orphan = OrphanMarker {
            key: "k2".into(),
            version: v.clone(),
            replicas: vec![BackendId::new("b2")],
        };
        meta.mark_stale(stale.clone()).await.unwrap();
        meta.mark_orphan(orphan.clone()).await.unwrap();

        assert_eq!(meta.list_stale().await.unwrap(), vec![stale]);
        assert_eq!(meta.list_orphans().await.unwrap(), vec![orphan]);

        meta.remove_stale_marker("k", &v).await.unwrap();
        meta.remove_orphan_marker("k2", &v).await.unwrap();
        // Removing again is a no-op.
        meta.remove_stale_marker("k", &v).await.unwrap();

        assert!(meta.list_stale().await.unwrap().is_empty());
        assert!(meta.list_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_keys_covers_published_records() {
        let meta = MemoryMetadataService::new();
        meta.conditional_publish("a", record(0, "w"), None)
            .await
            .unwrap();
        meta.conditional_publish("b", record(0, "w"), None)
            .await
            .unwrap();
        let mut keys = meta.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
