//! Nimbus Meta - Consistent metadata service interface
//!
//! The metadata service is the single serialization point of the whole
//! system: it stores, per logical key, the currently published version and
//! replica set, decides conditional publishes, and keeps the stale/orphan
//! bookkeeping the garbage collector consumes.
//!
//! The service itself is an external collaborator; this crate defines the
//! narrow interface the core consumes plus two implementations — an
//! in-memory one for tests and a redb-backed single-node stand-in.

pub mod local;
pub mod memory;
mod tables;

pub use local::LocalMetadataService;
pub use memory::MemoryMetadataService;

use async_trait::async_trait;
use nimbus_common::{MetaError, MetadataRecord, OrphanMarker, StaleMarker, Version};

/// Result type for metadata service calls.
pub type MetaResult<T> = Result<T, MetaError>;

/// Outcome of a conditional publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The record was installed. `previous` is the record it replaced, as
    /// stored at decision time — the publisher converts it into a stale
    /// marker. It may differ from the record the publisher read earlier if
    /// a lower-versioned concurrent publish slipped in between.
    Published {
        previous: Option<MetadataRecord>,
    },
    /// A version equal to or higher than the candidate is already
    /// published; nothing was changed.
    Conflict {
        current: MetadataRecord,
    },
}

/// Narrow, strongly-consistent metadata interface consumed by the
/// replication engine and the garbage collector.
///
/// A publish succeeds exactly when the stored version for the key is
/// strictly less than the candidate's (or the key has no record); the
/// ordering of [`Version`] makes at most one of two racing publishes win.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Fetch the current record for a key; `None` when the key has never
    /// been published (or was removed).
    async fn lookup(&self, key: &str) -> MetaResult<Option<MetadataRecord>>;

    /// Atomically install `record` for `key` if the stored version is
    /// strictly less than `record.version`.
    ///
    /// `expected_prev` is the version the publisher observed at lookup
    /// time; it does not influence the decision but lets the service
    /// detect and log intervening lower-version publishes.
    async fn conditional_publish(
        &self,
        key: &str,
        record: MetadataRecord,
        expected_prev: Option<Version>,
    ) -> MetaResult<PublishOutcome>;

    /// Remove the record for `key` if its version still equals
    /// `expected`. Returns whether a record was removed; a concurrent
    /// newer publish makes this a no-op.
    async fn remove(&self, key: &str, expected: &Version) -> MetaResult<bool>;

    /// Record a superseded version awaiting physical deletion.
    async fn mark_stale(&self, marker: StaleMarker) -> MetaResult<()>;

    /// Record a version whose publish lost the race and will never be
    /// referenced.
    async fn mark_orphan(&self, marker: OrphanMarker) -> MetaResult<()>;

    /// All pending stale markers.
    async fn list_stale(&self) -> MetaResult<Vec<StaleMarker>>;

    /// All pending orphan markers.
    async fn list_orphans(&self) -> MetaResult<Vec<OrphanMarker>>;

    /// Drop the stale marker for `(key, version)`; absent markers are a
    /// no-op.
    async fn remove_stale_marker(&self, key: &str, version: &Version) -> MetaResult<()>;

    /// Drop the orphan marker for `(key, version)`; absent markers are a
    /// no-op.
    async fn remove_orphan_marker(&self, key: &str, version: &Version) -> MetaResult<()>;

    /// Every logical key with a published record.
    async fn list_keys(&self) -> MetaResult<Vec<String>>;
}

/// Shared publish decision: does `candidate` supersede `current`?
pub(crate) fn supersedes(candidate: &Version, current: Option<&Version>) -> bool {
    current.is_none_or(|cur| cur < candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::ClientId;

    #[test]
    fn supersedes_rules() {
        let a = Version::new(1, ClientId::new("a").unwrap());
        let b = Version::new(2, ClientId::new("a").unwrap());
        let a_tie = Version::new(1, ClientId::new("b").unwrap());

        assert!(supersedes(&a, None));
        assert!(supersedes(&b, Some(&a)));
        assert!(!supersedes(&a, Some(&b)));
        assert!(!supersedes(&a, Some(&a)));
        // Same counter: client id decides.
        assert!(supersedes(&a_tie, Some(&a)));
        assert!(!supersedes(&a, Some(&a_tie)));
    }
}
