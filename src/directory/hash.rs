//! Stable hashing
//!
//! Hashes computed here must agree across processes, builds and clusters,
//! so std's randomized `DefaultHasher` cannot be used.

use xxhash_rust::xxh3::xxh3_64;

/// XXH3 64-bit hash of raw bytes. Seedless, so every host computes the same value.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Stable hash of a string.
pub fn stable_str_hash(value: &str) -> u64 {
    stable_hash(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(stable_str_hash("cluster-a"), stable_str_hash("cluster-a"));
        assert_eq!(stable_str_hash("cluster-a"), xxh3_64(b"cluster-a"));
    }

    #[test]
    fn test_hash_distinguishes_inputs() {
        assert_ne!(stable_str_hash("cluster-a"), stable_str_hash("cluster-b"));
        assert_ne!(stable_str_hash("ab"), stable_str_hash("ba"));
    }
}
