use std::collections::HashSet;
use std::hash::Hasher;

use rand::Rng;
use twox_hash::{XxHash32, XxHash64};

/// Generate `count` unique random tokens not present in `taken`.
pub fn generate_tokens(count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut used = taken.clone();
    let mut tokens = Vec::with_capacity(count);
    while tokens.len() < count {
        let candidate: u32 = rng.gen();
        if used.insert(candidate) {
            tokens.push(candidate);
        }
    }
    tokens
}

/// The index of the first entry in the sorted `tokens` table strictly
/// after `key`, wrapping around the circle.
pub fn search_token(tokens: &[(u32, String)], key: u32) -> usize {
    let idx = tokens.partition_point(|(t, _)| *t <= key);
    if idx == tokens.len() {
        0
    } else {
        idx
    }
}

/// A stable 32-bit token for an arbitrary string key.
///
/// Used to place non-series keys (e.g. compaction job sharding keys,
/// tenant ownership keys) on the circle.
pub fn ring_token(key: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(key.as_bytes());
    hasher.finish() as u32
}

/// A stable 64-bit hash for an arbitrary string key, used to seed
/// deterministic per-tenant selection.
pub fn stable_hash64(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    hasher.finish()
}
