//! Redb table definitions for the local metadata service.

use redb::TableDefinition;

/// Current record per logical key. Key: logical key, value: bincode-encoded
/// `MetadataRecord`.
pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Stale bookkeeping. Key: `"{key}#{version}"`, value: bincode-encoded
/// `StaleMarker`.
pub const STALE_MARKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("stale_markers");

/// Orphan bookkeeping. Key: `"{key}#{version}"`, value: bincode-encoded
/// `OrphanMarker`.
pub const ORPHAN_MARKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("orphan_markers");
