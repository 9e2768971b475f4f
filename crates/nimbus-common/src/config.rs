//! Configuration types for Nimbus
//!
//! One explicit `Config` value is built at startup and passed by reference
//! into each component that needs it. Nothing reads configuration ad hoc.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for Nimbus.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Writer identity; generated at startup when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Replication parameters.
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Backend ranking parameters.
    #[serde(default)]
    pub ranking: RankingConfig,
    /// Metadata service location.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Configured storage backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Replication width and quorum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of backends each write fans out to, chosen in rank order.
    pub width: usize,
    /// Acknowledgments required to treat a write as durable. Defaults to a
    /// strict majority of the width.
    pub quorum: Option<usize>,
}

impl ReplicationConfig {
    /// The effective write quorum.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum.unwrap_or(self.width / 2 + 1)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            width: 3,
            quorum: None,
        }
    }
}

/// Latency benchmark parameters for the ranking pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Size in bytes of the random probe payload (default: 100 KiB).
    pub sample_size: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            sample_size: 100 * 1024,
        }
    }
}

/// Metadata service location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path of the local metadata database.
    pub path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/nimbus/meta.redb"),
        }
    }
}

/// One configured storage backend account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend identity, unique within the configuration.
    pub id: String,
    /// Which store variant to construct.
    pub vendor: VendorConfig,
    /// Disabled backends are never selected or benchmarked.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Storage cost in cents per GB, the ranking tie-breaker.
    #[serde(default)]
    pub cost: u32,
}

const fn default_enabled() -> bool {
    true
}

/// Store variant selection; the configuration-time tag that replaces an
/// open driver hierarchy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VendorConfig {
    /// Transient in-process store.
    Memory,
    /// Local directory store.
    Fs {
        /// Directory holding the backend's blobs.
        root: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_quorum_is_strict_majority() {
        let r = ReplicationConfig {
            width: 3,
            quorum: None,
        };
        assert_eq!(r.quorum(), 2);

        let r = ReplicationConfig {
            width: 4,
            quorum: None,
        };
        assert_eq!(r.quorum(), 3);

        let r = ReplicationConfig {
            width: 4,
            quorum: Some(4),
        };
        assert_eq!(r.quorum(), 4);
    }

    #[test]
    fn backend_config_deserializes_tagged_vendor() {
        let json = serde_json::json!({
            "id": "local-a",
            "cost": 3,
            "vendor": { "kind": "fs", "root": "/tmp/nimbus-a" }
        });
        let cfg: BackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.id, "local-a");
        assert!(cfg.enabled);
        assert_eq!(cfg.cost, 3);
        assert!(matches!(cfg.vendor, VendorConfig::Fs { .. }));
    }

    #[test]
    fn memory_vendor_needs_no_fields() {
        let json = serde_json::json!({
            "id": "scratch",
            "vendor": { "kind": "memory" }
        });
        let cfg: BackendConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(cfg.vendor, VendorConfig::Memory));
        assert_eq!(cfg.cost, 0);
    }
}
