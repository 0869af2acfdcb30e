//! Distributed store abstraction.
//!
//! Everything the cache and the rate limiter need from the shared store is
//! expressed through the [`DistributedStore`] trait: byte-valued keys with
//! TTLs, hash fields, an atomic sliding-window batch, and a pub/sub channel
//! for invalidation fan-out. [`RedisStore`] is the production
//! implementation; [`MemoryStore`] backs tests and single-instance
//! deployments where no shared store is available.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreError;

/// Remaining lifetime of a key, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlState {
    /// Key exists and expires after the contained duration.
    Remaining(Duration),
    /// Key exists but has no expiry set.
    NoExpiry,
    /// Key does not exist.
    Missing,
}

/// Result of one atomic sliding-window batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlide {
    /// Number of entries in the window after pruning and inserting.
    pub count: u64,
    /// Timestamp (epoch ms) of the oldest surviving entry, if any.
    pub oldest_ms: Option<u64>,
}

/// Minimal key/value, hash, and sorted-window surface over the shared store.
///
/// All methods return [`StoreError`] on operational failure; none of them
/// panic. Implementations must be safe to call concurrently from many tasks.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unreachable or the read fails.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key` with the given TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Store `value` under `key` with a TTL only if the key does not exist.
    /// Returns `true` when the value was written (the lock was acquired).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a single key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete a batch of keys, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Collect every key matching a glob pattern (`*`, `?`, `[...]`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the scan fails.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Does `key` currently exist?
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the check fails.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining TTL of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lookup fails.
    async fn ttl_state(&self, key: &str) -> Result<TtlState, StoreError>;

    /// Atomically increment a counter and refresh its TTL. Returns the new
    /// counter value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Atomically apply several hash-field increments, returning the new
    /// value of each field in input order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails.
    async fn hash_incr_many(
        &self,
        key: &str,
        deltas: &[(&str, i64)],
    ) -> Result<Vec<i64>, StoreError>;

    /// Set a single hash field.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Set a hash field only if it is absent. Returns `true` when written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    /// Fetch every field of a hash. A missing hash yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the read fails.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// One atomic sliding-window step: prune entries with timestamps at or
    /// below `window_start_ms`, insert `member` at `now_ms`, refresh the
    /// window key's TTL, and report the surviving count and oldest entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the batch fails. Callers fall back to
    /// local counting in that case.
    async fn window_slide(
        &self,
        key: &str,
        window_start_ms: u64,
        now_ms: u64,
        member: &str,
        ttl: Duration,
    ) -> Result<WindowSlide, StoreError>;

    /// Publish a message on a pub/sub channel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the publish fails.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a pub/sub channel, yielding message payloads. The stream
    /// ends when the underlying connection drops; callers are expected to
    /// resubscribe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the subscription cannot be established.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;

    /// Round-trip liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store does not answer.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Milliseconds since the Unix epoch. The shared timebase for window
/// entries, envelope timestamps, and behavior records.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Match `key` against a store glob pattern.
///
/// Mirrors the store's own matching rules so local-tier pattern invalidation
/// removes exactly the keys a store-side scan would: `*` matches any run of
/// characters, `?` matches exactly one, `[...]` matches a character class
/// (ranges and a leading `^` for negation), and `\` escapes the next
/// character.
#[must_use]
pub fn key_matches(pattern: &str, key: &str) -> bool {
    glob_match(pattern.as_bytes(), key.as_bytes())
}

fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    let (mut p, mut k) = (0, 0);
    // Backtracking points for the most recent `*`.
    let (mut star_p, mut star_k) = (usize::MAX, 0);

    while k < key.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star_p = p;
                    star_k = k;
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    k += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next_p)) = class_match(pattern, p, key[k]) {
                        if matched {
                            p = next_p;
                            k += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == key[k] {
                        p += 2;
                        k += 1;
                        continue;
                    }
                }
                c => {
                    if c == key[k] {
                        p += 1;
                        k += 1;
                        continue;
                    }
                }
            }
        }
        // Mismatch: retry from the last `*`, consuming one more key byte.
        if star_p != usize::MAX {
            p = star_p + 1;
            star_k += 1;
            k = star_k;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match one byte against the character class starting at `pattern[open]`
/// (which must be `[`). Returns `(matched, index past the closing bracket)`,
/// or `None` when the class is unterminated.
fn class_match(pattern: &[u8], open: usize, byte: u8) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negated = pattern.get(i) == Some(&b'^');
    if negated {
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() {
        match pattern[i] {
            b'\\' if i + 1 < pattern.len() => {
                if pattern[i + 1] == byte {
                    matched = true;
                }
                i += 2;
            }
            b']' => return Some((matched != negated, i + 1)),
            // A dash is only a range when something follows it before the
            // closing bracket; `[a-]` means the literals `a` and `-`.
            lo if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' => {
                let (start, end) = if lo <= pattern[i + 2] {
                    (lo, pattern[i + 2])
                } else {
                    (pattern[i + 2], lo)
                };
                if start <= byte && byte <= end {
                    matched = true;
                }
                i += 3;
            }
            lo => {
                if lo == byte {
                    matched = true;
                }
                i += 1;
            }
        }
    }
    None
}
