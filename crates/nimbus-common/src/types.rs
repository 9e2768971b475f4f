//! Core type definitions for Nimbus
//!
//! This module defines the data model shared by the replication engine,
//! the backend pool and the metadata service: version identifiers, backend
//! identities, physical key derivation and the metadata bookkeeping records.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator between the logical key and the version suffix in a
/// [`BackendKey`]. Logical keys must not contain it.
pub const KEY_SEPARATOR: char = '#';

/// Identifier of one writer process.
///
/// Breaks ties between versions carrying the same counter, so it must be
/// unique per concurrent writer. Generated from a UUID when not configured.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client id from a configured string.
    pub fn new(id: impl Into<String>) -> Result<Self, KeyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(KeyError::Empty);
        }
        if id.contains(KEY_SEPARATOR) {
            return Err(KeyError::ReservedSeparator);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random client id.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(uuid.simple().to_string()[..8].to_string())
    }

    /// Get the client id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration-time identity of one storage backend account.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    /// Create a backend id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the backend id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendId({})", self.0)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from validating logical keys and client ids.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("key cannot be empty")]
    Empty,
    #[error("key cannot contain the reserved separator '{KEY_SEPARATOR}'")]
    ReservedSeparator,
}

/// Validate a logical key before it enters the protocol.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.contains(KEY_SEPARATOR) {
        return Err(KeyError::ReservedSeparator);
    }
    Ok(())
}

/// Globally comparable version identifier for one write.
///
/// Ordering is derived field by field: the counter is the primary key, the
/// client id breaks ties lexicographically. Two writers racing on the same
/// counter therefore resolve to exactly one winner without coordination.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    /// Monotonic write counter for the logical key.
    pub counter: u64,
    /// Writer identity, used as the deterministic tie-breaker.
    pub client_id: ClientId,
}

impl Version {
    /// Create a version from its parts.
    #[must_use]
    pub const fn new(counter: u64, client_id: ClientId) -> Self {
        Self { counter, client_id }
    }

    /// The first version a writer issues for a key with no published record.
    #[must_use]
    pub const fn initial(client_id: ClientId) -> Self {
        Self::new(0, client_id)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.counter, self.client_id)
    }
}

/// Physical key under which one version of a value is stored on a backend.
///
/// Derived deterministically from `(logical key, version)`; never exposed to
/// callers of the store API.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKey(String);

impl BackendKey {
    /// Derive the physical key for a logical key at a version.
    #[must_use]
    pub fn derive(key: &str, version: &Version) -> Self {
        Self(format!("{key}{KEY_SEPARATOR}{version}"))
    }

    /// Get the backend key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendKey({})", self.0)
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The currently published state of one logical key.
///
/// Only ever created or replaced through a successful conditional publish;
/// the listed replicas were confirmed to hold the data at publish time. The
/// digest lets a reader reject stale or corrupted bytes from a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Version this record points at.
    pub version: Version,
    /// Backends confirmed to hold the version's data at publish time.
    pub replicas: Vec<BackendId>,
    /// Content fingerprint of the value.
    pub digest: Digest,
    /// Value size in bytes.
    pub size: u64,
}

impl MetadataRecord {
    /// Create a record for a freshly replicated version.
    #[must_use]
    pub const fn new(
        version: Version,
        replicas: Vec<BackendId>,
        digest: Digest,
        size: u64,
    ) -> Self {
        Self {
            version,
            replicas,
            digest,
            size,
        }
    }
}

/// Bookkeeping entry for a superseded version awaiting physical deletion.
///
/// Recorded by the publisher immediately after a successful supersession,
/// consumed by the garbage collector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleMarker {
    /// Logical key the superseded version belonged to.
    pub key: String,
    /// The superseded version.
    pub version: Version,
    /// Backends that held the superseded version's data.
    pub replicas: Vec<BackendId>,
}

impl StaleMarker {
    /// Physical key the marked data lives under.
    #[must_use]
    pub fn backend_key(&self) -> BackendKey {
        BackendKey::derive(&self.key, &self.version)
    }
}

/// Bookkeeping entry for data whose publish lost a concurrency race.
///
/// The version was written to the listed backends but will never be pointed
/// to by any metadata record. Recorded by the losing writer, consumed by the
/// garbage collector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanMarker {
    /// Logical key the write was addressed to.
    pub key: String,
    /// The never-published version.
    pub version: Version,
    /// Backends the losing writer reached.
    pub replicas: Vec<BackendId>,
}

impl OrphanMarker {
    /// Physical key the marked data lives under.
    #[must_use]
    pub fn backend_key(&self) -> BackendKey {
        BackendKey::derive(&self.key, &self.version)
    }
}
