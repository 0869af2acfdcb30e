//! Adaptive multi-tier caching.
//!
//! Callers pick a [`CacheStrategy`]; the policy behind it decides TTL,
//! local-tier admission, and compression. Entries live in a bounded
//! process-local tier backed by the shared distributed store, with
//! cascade-aware invalidation and optional scheduled warming on top.

mod envelope;
mod local;

pub mod invalidation;
pub mod strategy;
pub mod tiered;
pub mod warmer;

pub use invalidation::{CascadeRule, CascadeTable, FanoutConfig, InvalidationEvent};
pub use strategy::{CacheStrategy, Compression, PolicyTable, StrategyPolicy};
pub use tiered::{CacheMetrics, TieredCache};
pub use warmer::{CacheLoader, CacheWarmer, PopularitySource, WarmerConfig, WarmerStats};
