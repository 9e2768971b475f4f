//! Version issuance for one writer process.

use nimbus_common::{ClientId, Version};
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces monotonically ordered versions for this writer.
///
/// The counter for a new version is one past the highest of (a) the
/// currently published version the writer observed and (b) anything this
/// clock has already issued. The metadata-assisted part keeps concurrent
/// writers comparable; the local floor keeps one process's versions
/// monotonic even when its lookups race each other.
pub struct VersionClock {
    client_id: ClientId,
    /// Lowest counter the next issued version may use.
    next_floor: AtomicU64,
}

impl VersionClock {
    /// Create a clock for a writer identity.
    #[must_use]
    pub const fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            next_floor: AtomicU64::new(0),
        }
    }

    /// This writer's identity.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Issue the version for a write superseding `published`.
    pub fn next(&self, published: Option<&Version>) -> Version {
        let base = published.map_or(0, |v| v.counter + 1);
        let mut floor = self.next_floor.load(Ordering::Relaxed);
        loop {
            let counter = base.max(floor);
            match self.next_floor.compare_exchange_weak(
                floor,
                counter + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Version::new(counter, self.client_id.clone()),
                Err(current) => floor = current,
            }
        }
    }
}
