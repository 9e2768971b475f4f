//! Replicated write and read protocol.

use crate::clock::VersionClock;
use bytes::Bytes;
use nimbus_common::config::ReplicationConfig;
use nimbus_common::{
    BackendId, BackendKey, ClientId, Digest, Error, MetadataRecord, OrphanMarker, Result,
    StaleMarker, Version, validate_key,
};
use nimbus_meta::{MetadataService, PublishOutcome};
use nimbus_store::BackendPool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Client-side engine implementing the replicated put/get protocol.
///
/// Writes are made durable first (parallel fan-out until a quorum of
/// backends acknowledge) and visible second (one conditional publish). A
/// crash or lost race between the two phases leaves data that is orphaned
/// but harmless — never a visible version that is under-replicated.
pub struct ReplicationEngine {
    pool: Arc<BackendPool>,
    meta: Arc<dyn MetadataService>,
    clock: VersionClock,
    replication: ReplicationConfig,
}

impl ReplicationEngine {
    /// Create an engine for one writer identity.
    #[must_use]
    pub fn new(
        pool: Arc<BackendPool>,
        meta: Arc<dyn MetadataService>,
        client_id: ClientId,
        replication: ReplicationConfig,
    ) -> Self {
        Self {
            pool,
            meta,
            clock: VersionClock::new(client_id),
            replication,
        }
    }

    /// Store `value` under `key`, superseding any published version.
    ///
    /// Returns the published version. Fails with
    /// [`Error::WriteQuorumFailed`] when too few backends acknowledge and
    /// with [`Error::PublishConflict`] when a concurrent writer published
    /// an equal-or-higher version first; in both cases the replicas that
    /// were written are recorded as orphans for the garbage collector, and
    /// the call is not retried automatically.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<Version> {
        validate_key(key)?;
        let current = self.meta.lookup(key).await?;
        let version = self.clock.next(current.as_ref().map(|r| &r.version));
        let backend_key = BackendKey::derive(key, &version);
        let digest = Digest::compute(&value);
        let size = value.len() as u64;

        let quorum = self.replication.quorum();
        let selection = self.pool.selection(self.replication.width);
        if selection.len() < quorum {
            return Err(Error::InsufficientBackends {
                available: selection.len(),
                required: quorum,
            });
        }

        let mut writes: JoinSet<(BackendId, bool)> = JoinSet::new();
        for store in selection {
            let pool = Arc::clone(&self.pool);
            let physical = backend_key.clone();
            let data = value.clone();
            writes.spawn(async move {
                let id = store.id().clone();
                match pool.put(store.as_ref(), physical.as_str(), data).await {
                    Ok(()) => (id, true),
                    Err(_) => {
                        // Logged by the pool; keep the backend out of
                        // future selections until the next ranking pass.
                        pool.mark_disabled(&id);
                        (id, false)
                    }
                }
            });
        }

        let mut acked: Vec<BackendId> = Vec::new();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((id, true)) => {
                    acked.push(id);
                    if acked.len() >= quorum {
                        break;
                    }
                }
                Ok((_, false)) => {}
                Err(e) => warn!("replica write task failed: {e}"),
            }
        }

        if acked.len() < quorum {
            if !acked.is_empty() {
                self.meta
                    .mark_orphan(OrphanMarker {
                        key: key.to_string(),
                        version: version.clone(),
                        replicas: acked.clone(),
                    })
                    .await?;
            }
            return Err(Error::WriteQuorumFailed {
                acked: acked.len(),
                required: quorum,
            });
        }

        // Quorum reached: stop blocking the caller, but keep observing the
        // stragglers. A late success lands on a backend the record does not
        // list; it stays invisible and the full sweep reclaims it once the
        // version is superseded.
        if !writes.is_empty() {
            let key_owned = key.to_string();
            let late_version = version.clone();
            tokio::spawn(async move {
                let mut writes = writes;
                while let Some(joined) = writes.join_next().await {
                    match joined {
                        Ok((id, true)) => debug!(
                            "late replica ack from {id} for '{key_owned}' at {late_version}"
                        ),
                        Ok((id, false)) => debug!(
                            "late replica failure from {id} for '{key_owned}' at {late_version}"
                        ),
                        Err(e) => warn!("replica write task failed: {e}"),
                    }
                }
            });
        }

        let record = MetadataRecord::new(version.clone(), acked.clone(), digest, size);
        let expected = current.map(|r| r.version);
        match self
            .meta
            .conditional_publish(key, record, expected)
            .await?
        {
            PublishOutcome::Published { previous } => {
                if let Some(previous) = previous {
                    self.meta
                        .mark_stale(StaleMarker {
                            key: key.to_string(),
                            version: previous.version,
                            replicas: previous.replicas,
                        })
                        .await?;
                }
                Ok(version)
            }
            PublishOutcome::Conflict { current } => {
                self.meta
                    .mark_orphan(OrphanMarker {
                        key: key.to_string(),
                        version,
                        replicas: acked,
                    })
                    .await?;
                Err(Error::PublishConflict {
                    current: current.version,
                })
            }
        }
    }

    /// Fetch the currently published value for `key`.
    ///
    /// `Ok(None)` means the key does not exist. A key that exists but whose
    /// listed replicas all fail or return corrupted bytes is
    /// [`Error::ReadUnavailable`] — possible data loss, never reported as
    /// absence.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let Some(record) = self.meta.lookup(key).await? else {
            return Ok(None);
        };
        let backend_key = BackendKey::derive(key, &record.version);

        let mut replicas = record.replicas.clone();
        replicas.sort_by_key(|id| self.pool.rank_index(id));

        for id in &replicas {
            let Some(store) = self.pool.store(id) else {
                warn!("record for '{key}' names unconfigured backend {id}");
                continue;
            };
            match self.pool.get(store.as_ref(), backend_key.as_str()).await {
                Ok(Some(data)) if record.digest.verify(&data) => return Ok(Some(data)),
                Ok(Some(_)) => {
                    warn!("digest mismatch from {id} for '{key}' at {}", record.version);
                }
                Ok(None) => {
                    warn!("replica {id} is missing '{backend_key}'");
                }
                Err(_) => {
                    // Logged by the pool.
                    self.pool.mark_disabled(id);
                }
            }
        }

        Err(Error::ReadUnavailable {
            key: key.to_string(),
            version: record.version,
        })
    }

    /// Remove the published version of `key`.
    ///
    /// The current replicas are marked stale before the pointer is removed,
    /// so a crash in between leaves a retryable marker rather than
    /// unreferenced blobs. Returns whether a record was removed; a racing
    /// newer publish wins and makes this a no-op.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let Some(record) = self.meta.lookup(key).await? else {
            return Ok(false);
        };
        self.meta
            .mark_stale(StaleMarker {
                key: key.to_string(),
                version: record.version.clone(),
                replicas: record.replicas.clone(),
            })
            .await?;
        Ok(self.meta.remove(key, &record.version).await?)
    }

    /// All logical keys with a published version.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.meta.list_keys().await?)
    }
}
