//! Redb-backed local metadata service.
//!
//! A single-node stand-in for the external consistent metadata store,
//! suitable for single-machine deployments and durable tests. Redb write
//! transactions are serialized, so deciding and installing a conditional
//! publish inside one write transaction gives the compare-and-swap the
//! protocol relies on.
//!
//! Unlike a write-behind cache, every method here propagates its error:
//! the metadata service is the correctness anchor of the system.

use crate::{MetaResult, MetadataService, PublishOutcome, supersedes, tables};
use async_trait::async_trait;
use nimbus_common::{
    KEY_SEPARATOR, MetaError, MetadataRecord, OrphanMarker, StaleMarker, Version,
};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::debug;

/// Metadata service persisted in one redb database file.
pub struct LocalMetadataService {
    db: Database,
}

impl LocalMetadataService {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(MetaError::storage)?;
        }
        let db = Database::create(path).map_err(MetaError::storage)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(MetaError::storage)?;
        {
            let _t = write_txn
                .open_table(tables::RECORDS)
                .map_err(MetaError::storage)?;
            let _t = write_txn
                .open_table(tables::STALE_MARKERS)
                .map_err(MetaError::storage)?;
            let _t = write_txn
                .open_table(tables::ORPHAN_MARKERS)
                .map_err(MetaError::storage)?;
        }
        write_txn.commit().map_err(MetaError::storage)?;

        Ok(Self { db })
    }

    fn marker_key(key: &str, version: &Version) -> String {
        format!("{key}{KEY_SEPARATOR}{version}")
    }

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaResult<()> {
        let bytes = bincode::serialize(value).map_err(MetaError::encoding)?;
        let write_txn = self.db.begin_write().map_err(MetaError::storage)?;
        {
            let mut table = write_txn
                .open_table(table_def)
                .map_err(MetaError::storage)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(MetaError::storage)?;
        }
        write_txn.commit().map_err(MetaError::storage)?;
        Ok(())
    }

    fn delete_key(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaResult<()> {
        let write_txn = self.db.begin_write().map_err(MetaError::storage)?;
        {
            let mut table = write_txn
                .open_table(table_def)
                .map_err(MetaError::storage)?;
            table.remove(key).map_err(MetaError::storage)?;
        }
        write_txn.commit().map_err(MetaError::storage)?;
        Ok(())
    }

    fn load_bincode_table<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
    ) -> MetaResult<Vec<T>> {
        let read_txn = self.db.begin_read().map_err(MetaError::storage)?;
        let table = read_txn
            .open_table(table_def)
            .map_err(MetaError::storage)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(MetaError::storage)? {
            let entry = entry.map_err(MetaError::storage)?;
            let value = bincode::deserialize::<T>(entry.1.value())
                .map_err(MetaError::encoding)?;
            result.push(value);
        }
        Ok(result)
    }
}

fn decode_record(bytes: &[u8]) -> MetaResult<MetadataRecord> {
    bincode::deserialize(bytes).map_err(MetaError::encoding)
}

#[async_trait]
impl MetadataService for LocalMetadataService {
    async fn lookup(&self, key: &str) -> MetaResult<Option<MetadataRecord>> {
        let read_txn = self.db.begin_read().map_err(MetaError::storage)?;
        let table = read_txn
            .open_table(tables::RECORDS)
            .map_err(MetaError::storage)?;
        match table.get(key).map_err(MetaError::storage)? {
            Some(guard) => Ok(Some(decode_record(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn conditional_publish(
        &self,
        key: &str,
        record: MetadataRecord,
        expected_prev: Option<Version>,
    ) -> MetaResult<PublishOutcome> {
        let write_txn = self.db.begin_write().map_err(MetaError::storage)?;
        let outcome = {
            let mut table = write_txn
                .open_table(tables::RECORDS)
                .map_err(MetaError::storage)?;
            let current = match table.get(key).map_err(MetaError::storage)? {
                Some(guard) => Some(decode_record(guard.value())?),
                None => None,
            };
            if let Some(cur) = &current
                && !supersedes(&record.version, Some(&cur.version))
            {
                PublishOutcome::Conflict {
                    current: cur.clone(),
                }
            } else {
                if current.as_ref().map(|r| &r.version) != expected_prev.as_ref() {
                    debug!(
                        "publish for '{key}' replaced a record the publisher had not seen"
                    );
                }
                let bytes = bincode::serialize(&record).map_err(MetaError::encoding)?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(MetaError::storage)?;
                PublishOutcome::Published { previous: current }
            }
        };
        write_txn.commit().map_err(MetaError::storage)?;
        Ok(outcome)
    }

    async fn remove(&self, key: &str, expected: &Version) -> MetaResult<bool> {
        let write_txn = self.db.begin_write().map_err(MetaError::storage)?;
        let removed = {
            let mut table = write_txn
                .open_table(tables::RECORDS)
                .map_err(MetaError::storage)?;
            let current = match table.get(key).map_err(MetaError::storage)? {
                Some(guard) => Some(decode_record(guard.value())?),
                None => None,
            };
            if current.is_some_and(|r| r.version == *expected) {
                table.remove(key).map_err(MetaError::storage)?;
                true
            } else {
                false
            }
        };
        write_txn.commit().map_err(MetaError::storage)?;
        Ok(removed)
    }

    async fn mark_stale(&self, marker: StaleMarker) -> MetaResult<()> {
        let table_key = Self::marker_key(&marker.key, &marker.version);
        self.put_bincode(tables::STALE_MARKERS, &table_key, &marker)
    }

    async fn mark_orphan(&self, marker: OrphanMarker) -> MetaResult<()> {
        let table_key = Self::marker_key(&marker.key, &marker.version);
        self.put_bincode(tables::ORPHAN_MARKERS, &table_key, &marker)
    }

    async fn list_stale(&self) -> MetaResult<Vec<StaleMarker>> {
        self.load_bincode_table(tables::STALE_MARKERS)
    }

    async fn list_orphans(&self) -> MetaResult<Vec<OrphanMarker>> {
        self.load_bincode_table(tables::ORPHAN_MARKERS)
    }

    async fn remove_stale_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.delete_key(tables::STALE_MARKERS, &Self::marker_key(key, version))
    }

    async fn remove_orphan_marker(&self, key: &str, version: &Version) -> MetaResult<()> {
        self.delete_key(tables::ORPHAN_MARKERS, &Self::marker_key(key, version))
    }

    async fn list_keys(&self) -> MetaResult<Vec<String>> {
        let read_txn = self.db.begin_read().map_err(MetaError::storage)?;
        let table = read_txn
            .open_table(tables::RECORDS)
            .map_err(MetaError::storage)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(MetaError::storage)? {
            let entry = entry.map_err(MetaError::storage)?;
            keys.push(entry.0.value().to_string());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{BackendId, ClientId, Digest};

    fn service(dir: &Path) -> LocalMetadataService {
        LocalMetadataService::open(dir.join("meta.redb")).unwrap()
    }

    fn record(counter: u64, client: &str) -> MetadataRecord {
        MetadataRecord::new(
            Version::new(counter, ClientId::new(client).unwrap()),
            vec![BackendId::new("b1"), BackendId::new("b2")],
            Digest::compute(b"payload"),
            7,
        )
    }

    #[tokio::test]
    async fn publish_lookup_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(0, "w1");
        {
            let meta = service(dir.path());
            meta.conditional_publish("k", rec.clone(), None)
                .await
                .unwrap();
        }
        let meta = service(dir.path());
        assert_eq!(meta.lookup("k").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn conditional_publish_enforces_order() {
        let dir = tempfile::tempdir().unwrap();
        let meta = service(dir.path());
        let first = record(1, "w1");
        meta.conditional_publish("k", first.clone(), None)
            .await
            .unwrap();

        let outcome = meta
            .conditional_publish("k", record(1, "w1"), Some(first.version.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Conflict { current: first.clone() });

        let outcome = meta
            .conditional_publish("k", record(2, "w1"), Some(first.version.clone()))
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
    async fn markers_persist_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let meta = service(dir.path());
        let v = Version::new(3, ClientId::new("w1").unwrap());
        let stale = StaleMarker {
            key: "k".into(),
            version: v.clone(),
            replicas: vec![BackendId::new("b1")],
        };
        let orphan = OrphanMarker {
            key: "k".into(),
            version: v.clone(),
            replicas: vec![BackendId::new("b2")],
        };
        meta.mark_stale(stale.clone()).await.unwrap();
        meta.mark_orphan(orphan.clone()).await.unwrap();

        assert_eq!(meta.list_stale().await.unwrap(), vec![stale]);
        assert_eq!(meta.list_orphans().await.unwrap(), vec![orphan]);

        meta.remove_stale_marker("k", &v).await.unwrap();
        meta.remove_orphan_marker("k", &v).await.unwrap();
        assert!(meta.list_stale().await.unwrap().is_empty());
        assert!(meta.list_orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_record_checks_version() {
        let dir = tempfile::tempdir().unwrap();
        let meta = service(dir.path());
        let rec = record(4, "w1");
        meta.conditional_publish("k", rec.clone(), None)
            .await
            .unwrap();

        let stranger = Version::new(9, ClientId::new("w9").unwrap());
        assert!(!meta.remove("k", &stranger).await.unwrap());
        assert!(meta.remove("k", &rec.version).await.unwrap());
        assert_eq!(meta.lookup("k").await.unwrap(), None);
        assert!(meta.list_keys().await.unwrap().is_empty());
    }
}
