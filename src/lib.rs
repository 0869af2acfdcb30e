//! Adaptive Gate
//!
//! Caching and rate limiting for request-serving backends, sharing one
//! Redis-compatible store:
//! - **Two-Tier Cache**: process-local tier in front of a distributed store,
//!   with strategy-based TTLs, compression, and eviction
//! - **Cascade Invalidation**: entity-relationship rules drop dependent keys
//!   together, with optional pub/sub fan-out to sibling instances
//! - **Stampede Protection**: DashMap + Mutex request coalescing
//! - **Cache Warming**: scheduled preloading of popular keys behind a
//!   cross-instance lock
//! - **Behavior-Aware Rate Limiting**: sliding windows sized per identity
//!   category, tightened by recent misbehavior, with automatic blocking
//! - **Fail-Open Degradation**: a store outage turns into cache misses and
//!   per-instance fallback windows, never into user-facing errors
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use adaptive_gate::{AdaptiveGate, CacheStrategy, Identity};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Connects to Redis via REDIS_URL (default redis://127.0.0.1:6379)
//!     let gate = AdaptiveGate::new().await?;
//!     gate.start();
//!
//!     // Admit the request
//!     let identity = Identity::user("alice");
//!     let decision = gate.limiter().evaluate(&identity, "api/reports").await;
//!     if !decision.allowed {
//!         tracing::warn!(retry_after = decision.retry_after_secs(), "throttled");
//!         return Ok(());
//!     }
//!
//!     // Serve from cache, computing on miss with stampede protection
//!     let report = gate
//!         .cache()
//!         .get_or_load("report:monthly", CacheStrategy::Warm, || async {
//!             Ok(serde_json::json!({"total": 42}))
//!         })
//!         .await?;
//!     tracing::info!(%report, "served");
//!
//!     // Feed the outcome back into the identity's behavior profile
//!     gate.limiter().record_outcome(&identity, true, 200).await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → RateLimiter ──────────────────→ TieredCache → Loader
//!           │ category + behavior            │ local tier (per strategy)
//!           │ sliding window (store)         │ distributed store (shared)
//!           ↓ degraded: local fallback       ↓ degraded: local-only, miss
//! ```
//!
//! Both halves degrade independently: the cache keeps serving local hits and
//! treats the store as a miss, the limiter counts in a per-instance fixed
//! window until the store returns.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

pub mod builder;
pub mod cache;
pub mod error;
pub mod limiter;
pub mod store;

pub use builder::AdaptiveGateBuilder;
pub use cache::{
    CacheLoader, CacheMetrics, CacheStrategy, CacheWarmer, CascadeRule, CascadeTable, Compression,
    FanoutConfig, InvalidationEvent, PolicyTable, PopularitySource, StrategyPolicy, TieredCache,
    WarmerConfig, WarmerStats,
};
pub use error::{CodecError, ConfigError, StoreError};
pub use limiter::{
    categorize, should_block, BehaviorMetrics, Category, CategoryLimit, EffectiveLimit,
    EndpointMultipliers, Identity, IdentityStatus, LimitTable, LimiterMetrics, RateDecision,
    RateLimiter,
};
pub use store::{DistributedStore, MemoryStore, RedisStore, TtlState, WindowSlide};

// Re-export async_trait for implementers of the store and warmer traits
pub use async_trait::async_trait;

/// Main entry point: a cache and a rate limiter over one shared store.
///
/// Cheap to clone; all clones share the same tiers, windows, and counters.
/// Built via [`AdaptiveGate::builder`], or [`AdaptiveGate::new`] for stock
/// policies against Redis.
///
/// # Example
///
/// ```rust,no_run
/// use adaptive_gate::AdaptiveGate;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let gate = AdaptiveGate::new().await?;
///     gate.start();
///
///     let cache = gate.cache();
///     let limiter = gate.limiter();
///
///     gate.stop();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct AdaptiveGate {
    pub(crate) cache: Arc<TieredCache>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) warmer: Option<Arc<CacheWarmer>>,
    pub(crate) store: Arc<dyn DistributedStore>,
}

impl AdaptiveGate {
    /// Build a gate with stock policies against Redis.
    ///
    /// The connection is configured via the `REDIS_URL` environment
    /// variable, defaulting to `redis://127.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Fails when Redis cannot be reached.
    pub async fn new() -> Result<Self> {
        info!("initializing adaptive gate");
        Self::builder().build().await
    }

    /// Build a gate with stock policies against a specific Redis instance.
    ///
    /// # Errors
    ///
    /// Fails when Redis cannot be reached.
    pub async fn with_redis_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "initializing adaptive gate");
        Self::builder().redis_url(redis_url).build().await
    }

    #[must_use]
    pub fn builder() -> AdaptiveGateBuilder {
        AdaptiveGateBuilder::new()
    }

    /// The caching half. All cache operations go through here.
    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// The rate-limiting half.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one warming pass by hand, outside the warmer's schedule. Returns
    /// how many keys were loaded, zero when no warmer is configured.
    pub async fn warm_cache(&self) -> usize {
        match &self.warmer {
            Some(warmer) => warmer.warm_once().await,
            None => {
                debug!("warm_cache called without a configured warmer");
                0
            }
        }
    }

    /// Warming counters, when a warmer is configured.
    #[must_use]
    pub fn warmer_stats(&self) -> Option<WarmerStats> {
        Some(self.warmer.as_ref()?.stats())
    }

    /// Start the background tasks: local-tier sweeping, invalidation
    /// fan-out (when enabled), fallback-window purging, and scheduled
    /// warming (when configured). Idempotent.
    pub fn start(&self) {
        self.cache.start();
        self.limiter.start();
        if let Some(warmer) = &self.warmer {
            warmer.start();
        }
    }

    /// Stop the background tasks. Idempotent; the gate itself keeps
    /// serving requests.
    pub fn stop(&self) {
        if let Some(warmer) = &self.warmer {
            warmer.stop();
        }
        self.limiter.stop();
        self.cache.stop();
    }

    /// Probe both halves of the gate.
    ///
    /// Returns `true` while the local tier works, even with the store down:
    /// that is exactly the degraded mode the gate is built to ride out. The
    /// store's state is logged either way.
    pub async fn health_check(&self) -> bool {
        let local_ok = self.cache.local_probe();
        let store_ok = self.store.ping().await.is_ok();

        if local_ok && store_ok {
            debug!("health check passed");
        } else {
            warn!(local_ok, store_ok, "health check found degraded components");
        }
        local_ok
    }
}
