//! Error types for Nimbus
//!
//! One taxonomy for the whole system. Backend failures are always wrapped
//! with the offending backend's identity and the attempted key; metadata
//! service errors pass through unwrapped, since the service is a single
//! consistent authority with no partial-failure semantics. Absence of a key
//! is expressed as `Ok(None)` by the read paths, never as an error.

use crate::types::{BackendId, KeyError, Version};
use thiserror::Error;

/// Common result type for Nimbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single call against one storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Create an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Check whether this failure is an authorization rejection.
    ///
    /// Authorization failures disable the backend for future selection;
    /// other failures may be transient.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Failure inside the metadata service.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("metadata storage error: {0}")]
    Storage(String),

    #[error("metadata encoding error: {0}")]
    Encoding(String),
}

impl MetaError {
    /// Create a storage error from any displayable cause.
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Self::Storage(cause.to_string())
    }

    /// Create an encoding error from any displayable cause.
    pub fn encoding(cause: impl std::fmt::Display) -> Self {
        Self::Encoding(cause.to_string())
    }
}

/// Common error type for Nimbus.
#[derive(Debug, Error)]
pub enum Error {
    /// A single backend call failed. The operation it was part of may still
    /// succeed from the remaining backends.
    #[error("backend {backend} failed on key '{key}': {source}")]
    Backend {
        backend: BackendId,
        key: String,
        #[source]
        source: BackendError,
    },

    /// Fewer backends acknowledged a put than the write quorum requires.
    /// Partial successes are left for the garbage collector as orphans.
    #[error("write quorum not reached: {acked} of {required} required acks")]
    WriteQuorumFailed { acked: usize, required: usize },

    /// The conditional publish lost to a concurrent writer. The data is
    /// durable but will never become visible; not retriable.
    #[error("publish lost to concurrently published version {current}")]
    PublishConflict { current: Version },

    /// A metadata record exists but no listed replica returned intact data.
    /// Possible data loss; never conflated with absence of the key.
    #[error("no listed replica returned intact data for '{key}' at version {version}")]
    ReadUnavailable { key: String, version: Version },

    /// Not enough enabled backends to satisfy the replication width.
    #[error("not enough enabled backends: have {available}, need {required}")]
    InsufficientBackends { available: usize, required: usize },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Metadata(#[from] MetaError),
}

impl Error {
    /// Wrap a backend failure with the offending backend and key.
    pub fn backend(
        backend: BackendId,
        key: impl Into<String>,
        source: BackendError,
    ) -> Self {
        Self::Backend {
            backend,
            key: key.into(),
            source,
        }
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check whether this is a lost publish race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::PublishConflict { .. })
    }

    /// Check whether this is a failed write quorum.
    #[must_use]
    pub const fn is_quorum_failure(&self) -> bool {
        matches!(self, Self::WriteQuorumFailed { .. })
    }
}
