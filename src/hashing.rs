//! Content hashing helpers.
//!
//! SHA3-256 hex digests are used for attempt bookkeeping, backup file
//! suffixes, and circular-modification detection.

use sha3::{Digest, Sha3_256};

/// Full SHA3-256 hex digest of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 8-character short form used in filenames and branch suffixes.
pub fn short_hash(data: &[u8]) -> String {
    let mut h = content_hash(data);
    h.truncate(8);
    h
}

/// Hash only the first `prefix_bytes` of `data` (0 = full content).
/// Truncated-prefix hashing is a deliberate knob for circular-modification
/// detection, where near-identical rewrites should collide.
pub fn prefix_hash(data: &[u8], prefix_bytes: usize) -> String {
    if prefix_bytes == 0 || data.len() <= prefix_bytes {
        content_hash(data)
    } else {
        content_hash(&data[..prefix_bytes])
    }
}
