//! Error taxonomy for the adaptive gate.
//!
//! Three families, kept deliberately separate:
//! - [`StoreError`] — operational failures talking to the distributed store.
//!   These are always recoverable: the cache treats them as misses and the
//!   rate limiter falls back to local counting.
//! - [`CodecError`] — payload serialization, deserialization, and
//!   compression failures. A corrupt stored entry decodes into one of these
//!   and is treated as a miss.
//! - [`ConfigError`] — invalid configuration detected at startup. These are
//!   the only errors that should abort construction.

use thiserror::Error;

/// Operational failure in the distributed store.
///
/// Callers inside this crate never propagate these to the public cache or
/// limiter surface; they degrade to local behavior and log instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("distributed store connection failed: {0}")]
    Connection(String),

    /// The store was reached but the operation timed out.
    #[error("distributed store operation timed out: {0}")]
    Timeout(String),

    /// The store rejected or failed the operation.
    #[error("distributed store operation failed: {0}")]
    Operation(String),
}

/// Failure while encoding or decoding a cached payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload serialization failed: {0}")]
    Serialize(String),

    #[error("payload deserialization failed: {0}")]
    Deserialize(String),

    #[error("payload compression failed: {0}")]
    Compress(String),

    #[error("payload decompression failed: {0}")]
    Decompress(String),
}

/// Invalid configuration, reported when the gate is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A strategy name did not parse. Raised at the call site so typos in
    /// caller-supplied strategy strings fail fast instead of caching under
    /// the wrong policy.
    #[error("unknown cache strategy `{0}`")]
    UnknownStrategy(String),

    #[error("cache strategy {strategy} has a zero TTL")]
    ZeroTtl { strategy: &'static str },

    #[error("cache strategy {strategy} is local-cacheable but allows zero local items")]
    ZeroLocalCapacity { strategy: &'static str },

    #[error("rate limit category {category} has a zero-length window")]
    ZeroWindow { category: &'static str },

    #[error("endpoint multiplier for `{endpoint}` must be positive, got {value}")]
    NonPositiveMultiplier { endpoint: String, value: f64 },

    /// The cascade table contains a cycle. Detected by graph traversal when
    /// the gate is built, before any invalidation can run.
    #[error("cascade rules form a cycle through entity type `{entity}`")]
    CyclicCascade { entity: String },

    /// A direct pattern has no `*` placeholder to substitute the entity id
    /// into, so it would invalidate the same keys for every id.
    #[error("cascade pattern `{pattern}` for entity type `{entity}` has no `*` placeholder")]
    MalformedCascadePattern { entity: String, pattern: String },

    /// A cascade rule points at an entity type the table does not define.
    #[error("cascade rule for `{entity}` references unknown entity type `{target}`")]
    UnknownCascadeTarget { entity: String, target: String },
}
