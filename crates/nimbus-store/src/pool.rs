//! Ranked pool of configured backends.
//!
//! The pool owns every configured [`BackendStore`] for the process
//! lifetime, ranks them with a one-time concurrent latency benchmark, and
//! delegates raw operations with uniform error wrapping that preserves the
//! offending backend's identity and the attempted key.

use crate::backend::BackendStore;
use crate::fs::FsBackend;
use crate::memory::MemoryBackend;
use bytes::Bytes;
use nimbus_common::config::{Config, VendorConfig};
use nimbus_common::{BackendId, Error, Result};
use parking_lot::RwLock;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Immutable measurement snapshot for one backend, produced by the ranking
/// pass. Latency and enabled state live here, not on the store itself, so
/// concurrent benchmark workers never share mutable state.
#[derive(Clone, Debug)]
pub struct BackendProfile {
    /// Backend identity.
    pub id: BackendId,
    /// Storage cost in cents per GB.
    pub cost: u32,
    /// Disabled backends sort last and are never selected.
    pub enabled: bool,
    /// Measured write latency; `Duration::MAX` when the probe failed.
    pub write_latency: Duration,
    /// Measured read latency; `Duration::MAX` when the probe failed.
    pub read_latency: Duration,
}

impl BackendProfile {
    fn unprobed(id: BackendId, cost: u32, enabled: bool) -> Self {
        Self {
            id,
            cost,
            enabled,
            write_latency: Duration::ZERO,
            read_latency: Duration::ZERO,
        }
    }

    /// Combined write + read latency used as the primary ranking key.
    #[must_use]
    pub fn total_latency(&self) -> Duration {
        self.write_latency.saturating_add(self.read_latency)
    }
}

/// Total, symmetric ranking order: enabled first, then combined latency,
/// then cost.
fn sort_by_rank(profiles: &mut [BackendProfile]) {
    profiles.sort_by(|a, b| {
        b.enabled
            .cmp(&a.enabled)
            .then_with(|| a.total_latency().cmp(&b.total_latency()))
            .then_with(|| a.cost.cmp(&b.cost))
    });
}

/// Pool of configured backends with a ranking snapshot.
pub struct BackendPool {
    stores: Vec<Arc<dyn BackendStore>>,
    ranking: RwLock<Vec<BackendProfile>>,
}

impl BackendPool {
    /// Create a pool over already-constructed stores, all enabled, in the
    /// given order until a ranking pass runs.
    #[must_use]
    pub fn new(stores: Vec<Arc<dyn BackendStore>>) -> Self {
        let ranking = stores
            .iter()
            .map(|s| BackendProfile::unprobed(s.id().clone(), s.cost(), true))
            .collect();
        Self {
            stores,
            ranking: RwLock::new(ranking),
        }
    }

    /// Build the pool from configuration, constructing one store per
    /// configured backend according to its vendor tag.
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        let mut stores: Vec<Arc<dyn BackendStore>> = Vec::with_capacity(cfg.backends.len());
        let mut ranking = Vec::with_capacity(cfg.backends.len());

        for backend in &cfg.backends {
            let id = BackendId::new(backend.id.clone());
            if stores.iter().any(|s| *s.id() == id) {
                return Err(Error::configuration(format!(
                    "duplicate backend id '{id}'"
                )));
            }
            let store: Arc<dyn BackendStore> = match &backend.vendor {
                VendorConfig::Memory => {
                    Arc::new(MemoryBackend::new(id.clone(), backend.cost))
                }
                VendorConfig::Fs { root } => Arc::new(
                    FsBackend::open(id.clone(), backend.cost, root.clone())
                        .await
                        .map_err(|e| Error::backend(id.clone(), "<open>", e))?,
                ),
            };
            ranking.push(BackendProfile::unprobed(id, backend.cost, backend.enabled));
            stores.push(store);
        }

        Ok(Self {
            stores,
            ranking: RwLock::new(ranking),
        })
    }

    /// All configured stores, in configuration order.
    #[must_use]
    pub fn stores(&self) -> &[Arc<dyn BackendStore>] {
        &self.stores
    }

    /// Look up a store by identity.
    #[must_use]
    pub fn store(&self, id: &BackendId) -> Option<Arc<dyn BackendStore>> {
        self.stores.iter().find(|s| s.id() == id).cloned()
    }

    /// Current ranking snapshot, best first.
    #[must_use]
    pub fn ranking(&self) -> Vec<BackendProfile> {
        self.ranking.read().clone()
    }

    /// The first `width` enabled stores in rank order.
    #[must_use]
    pub fn selection(&self, width: usize) -> Vec<Arc<dyn BackendStore>> {
        self.ranking
            .read()
            .iter()
            .filter(|p| p.enabled)
            .take(width)
            .filter_map(|p| self.store(&p.id))
            .collect()
    }

    /// Position of a backend in the current ranking; unknown backends sort
    /// after every ranked one.
    #[must_use]
    pub fn rank_index(&self, id: &BackendId) -> usize {
        self.ranking
            .read()
            .iter()
            .position(|p| p.id == *id)
            .unwrap_or(usize::MAX)
    }

    /// Demote a backend to disabled in the current snapshot, keeping it out
    /// of future selections until the next ranking pass.
    pub fn mark_disabled(&self, id: &BackendId) {
        let mut ranking = self.ranking.write();
        if let Some(profile) = ranking.iter_mut().find(|p| p.id == *id) {
            if profile.enabled {
                warn!("disabling backend {id} for future selections");
                profile.enabled = false;
            }
        }
        sort_by_rank(&mut ranking);
    }

    /// Benchmark every enabled backend concurrently and install a fresh
    /// ranking snapshot, which is also returned.
    ///
    /// Each probe is one timed write and one timed, read-back-verified read
    /// of a random `sample_size`-byte payload on a throwaway key. A backend
    /// answering with an authorization error is disabled. All probes are
    /// joined before sorting; there is no global timeout beyond the
    /// backends' own failures.
    pub async fn rank(&self, sample_size: usize) -> Vec<BackendProfile> {
        let targets: Vec<(Arc<dyn BackendStore>, bool)> = {
            let ranking = self.ranking.read();
            self.stores
                .iter()
                .map(|s| {
                    let enabled = ranking
                        .iter()
                        .find(|p| p.id == *s.id())
                        .is_some_and(|p| p.enabled);
                    (Arc::clone(s), enabled)
                })
                .collect()
        };

        let probes = targets.into_iter().map(|(store, enabled)| async move {
            if enabled {
                probe(&store, sample_size).await
            } else {
                BackendProfile::unprobed(store.id().clone(), store.cost(), false)
            }
        });
        let mut profiles = futures::future::join_all(probes).await;

        sort_by_rank(&mut profiles);
        for p in &profiles {
            debug!(
                "ranked backend {}: enabled={} write={:?} read={:?} cost={}",
                p.id, p.enabled, p.write_latency, p.read_latency, p.cost
            );
        }
        *self.ranking.write() = profiles.clone();
        profiles
    }

    // ---- Raw delegation with uniform error wrapping ----

    /// Put a value on one backend.
    pub async fn put(&self, store: &dyn BackendStore, key: &str, data: Bytes) -> Result<()> {
        store.put(key, data).await.map_err(|e| {
            warn!("could not put '{}' on {}: {}", key, store.id(), e);
            Error::backend(store.id().clone(), key, e)
        })
    }

    /// Get a value from one backend; `None` when absent.
    pub async fn get(&self, store: &dyn BackendStore, key: &str) -> Result<Option<Bytes>> {
        store.get(key).await.map_err(|e| {
            warn!("could not get '{}' from {}: {}", key, store.id(), e);
            Error::backend(store.id().clone(), key, e)
        })
    }

    /// Delete a key on one backend.
    pub async fn delete(&self, store: &dyn BackendStore, key: &str) -> Result<()> {
        store.delete(key).await.map_err(|e| {
            warn!("could not delete '{}' from {}: {}", key, store.id(), e);
            Error::backend(store.id().clone(), key, e)
        })
    }

    /// List every key on one backend.
    pub async fn list(&self, store: &dyn BackendStore) -> Result<Vec<String>> {
        store.list().await.map_err(|e| {
            warn!("could not list keys on {}: {}", store.id(), e);
            Error::backend(store.id().clone(), "<list>", e)
        })
    }

    /// Delete every key on one backend, best effort. Destructive
    /// maintenance operation; individual delete failures are skipped.
    /// Returns the number of keys deleted.
    pub async fn empty_container(&self, store: &dyn BackendStore) -> Result<usize> {
        let keys = self.list(store).await?;
        let mut deleted = 0;
        for key in keys {
            match store.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    "could not delete '{}' while emptying {}: {}",
                    key,
                    store.id(),
                    e
                ),
            }
        }
        Ok(deleted)
    }
}

/// Benchmark one backend. Mirrors the write-then-verified-read probe the
/// ranking contract requires; a write failure skips the read phase.
async fn probe(store: &Arc<dyn BackendStore>, sample_size: usize) -> BackendProfile {
    let mut profile =
        BackendProfile::unprobed(store.id().clone(), store.cost(), true);
    let key = format!("latency-probe-{:08x}", rand::random::<u32>());
    let mut payload = vec![0u8; sample_size];
    rand::thread_rng().fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    let start = Instant::now();
    match store.put(&key, payload.clone()).await {
        Ok(()) => profile.write_latency = start.elapsed(),
        Err(e) => {
            warn!("latency probe write failed on {}: {}", store.id(), e);
            profile.write_latency = Duration::MAX;
            profile.read_latency = Duration::MAX;
            if e.is_unauthorized() {
                profile.enabled = false;
            }
            return profile;
        }
    }

    let start = Instant::now();
    match store.get(&key).await {
        Ok(Some(data)) if data == payload => profile.read_latency = start.elapsed(),
        Ok(_) => {
            warn!("latency probe read-back mismatch on {}", store.id());
            profile.read_latency = Duration::MAX;
        }
        Err(e) => {
            warn!("latency probe read failed on {}: {}", store.id(), e);
            profile.read_latency = Duration::MAX;
            if e.is_unauthorized() {
                profile.enabled = false;
            }
        }
    }

    if let Err(e) = store.delete(&key).await {
        debug!("could not clean up probe key on {}: {}", store.id(), e);
    }
    profile
}
