//! Uniform capability interface over one storage backend.
//!
//! Every cloud account the system replicates to is driven through this
//! trait. Vendor adapters are thin translations onto their SDKs; the two
//! variants shipped here (memory, filesystem) are enough to run the full
//! protocol on one machine.

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_common::{BackendError, BackendId};

/// Result type for raw backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// One storage backend, reachable through put/get/delete/list on string
/// keys with opaque byte values.
///
/// Implementations must be safe to call concurrently; the pool fans out
/// operations to several backends at once. Latency and enabled state are
/// deliberately not part of this trait — they belong to the pool's ranking
/// snapshot, which is rebuilt by the benchmark pass instead of mutated in
/// place on the store.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Configuration-time identity of this backend.
    fn id(&self) -> &BackendId;

    /// Storage cost in cents per GB, the ranking tie-breaker.
    fn cost(&self) -> u32;

    /// Store a value under a physical key, overwriting any previous value.
    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()>;

    /// Fetch a value; `None` when the key is absent.
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// List every key the backend currently holds.
    async fn list(&self) -> BackendResult<Vec<String>>;
}
