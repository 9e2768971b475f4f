//! Content digests for replica verification.
//!
//! A value's digest is stored in its metadata record and checked against
//! every replica read, so a backend returning stale or corrupted bytes is
//! detected instead of served.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-algorithm content fingerprint (CRC32C + xxHash64).
///
/// Both are cheap to compute; requiring both to match makes an accidental
/// collision on corrupted data vanishingly unlikely.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// CRC32C checksum.
    pub crc32c: u32,
    /// xxHash64 hash.
    pub xxh64: u64,
}

impl Digest {
    /// Compute the digest of a value.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxh64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this digest.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
            && xxhash_rust::xxh64::xxh64(data, 0) == self.xxh64
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.crc32c, self.xxh64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trip() {
        let data = b"hello, clouds";
        let digest = Digest::compute(data);
        assert!(digest.verify(data));
    }

    #[test]
    fn digest_rejects_corruption() {
        let digest = Digest::compute(b"hello, clouds");
        assert!(!digest.verify(b"hello, cloudz"));
        assert!(!digest.verify(b""));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(Digest::compute(b"abc"), Digest::compute(b"abc"));
        assert_ne!(Digest::compute(b"abc"), Digest::compute(b"abd"));
    }
}
