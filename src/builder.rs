//! Builder for assembling an [`AdaptiveGate`] with custom policies.
//!
//! # Example: Default Wiring
//!
//! ```rust,no_run
//! use adaptive_gate::AdaptiveGate;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gate = AdaptiveGate::builder()
//!         .redis_url("redis://127.0.0.1:6379")
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-Memory Store
//!
//! ```rust
//! use std::sync::Arc;
//! use adaptive_gate::{AdaptiveGate, MemoryStore};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let gate = AdaptiveGate::builder()
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::cache::{
    CacheLoader, CacheStrategy, CacheWarmer, CascadeRule, CascadeTable, FanoutConfig, PolicyTable,
    PopularitySource, StrategyPolicy, TieredCache, WarmerConfig,
};
use crate::limiter::{
    Category, CategoryLimit, EndpointMultipliers, LimitTable, PolicyResolver, RateLimiter,
};
use crate::store::{DistributedStore, RedisStore};
use crate::AdaptiveGate;

struct WarmerParts {
    source: Arc<dyn PopularitySource>,
    loader: Arc<dyn CacheLoader>,
    config: WarmerConfig,
}

/// Builder for [`AdaptiveGate`].
///
/// Every knob has a default: the four stock strategy policies, the five
/// category limits, the auth/health endpoint weights, no cascade rules, no
/// fan-out, no warmer, and a Redis store configured from `REDIS_URL`.
/// Configuration is validated once in [`build`](Self::build), so a gate that
/// constructs is a gate with coherent policies.
pub struct AdaptiveGateBuilder {
    redis_url: Option<String>,
    store: Option<Arc<dyn DistributedStore>>,
    policies: PolicyTable,
    cascades: CascadeTable,
    fanout: FanoutConfig,
    limits: LimitTable,
    multipliers: EndpointMultipliers,
    warmer: Option<WarmerParts>,
    sweep_interval: Duration,
    purge_interval: Duration,
    suspicious_ttl: Duration,
}

impl AdaptiveGateBuilder {
    pub fn new() -> Self {
        Self {
            redis_url: None,
            store: None,
            policies: PolicyTable::default(),
            cascades: CascadeTable::new(),
            fanout: FanoutConfig::default(),
            limits: LimitTable::default(),
            multipliers: EndpointMultipliers::default(),
            warmer: None,
            sweep_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(60),
            suspicious_ttl: Duration::from_secs(1800),
        }
    }

    /// Connect to this Redis instance instead of reading `REDIS_URL`.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Use an already-constructed store instead of connecting to Redis.
    ///
    /// This is how tests run the full gate against [`MemoryStore`], and how
    /// embedders plug in their own [`DistributedStore`] implementation.
    ///
    /// [`MemoryStore`]: crate::MemoryStore
    pub fn with_store(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the policy for one cache strategy.
    ///
    /// # Example
    ///
    /// ```rust
    /// use adaptive_gate::{AdaptiveGateBuilder, CacheStrategy, StrategyPolicy};
    ///
    /// let builder = AdaptiveGateBuilder::new().strategy_policy(
    ///     CacheStrategy::Hot,
    ///     StrategyPolicy {
    ///         ttl: std::time::Duration::from_secs(120),
    ///         ..StrategyPolicy::default_for(CacheStrategy::Hot)
    ///     },
    /// );
    /// ```
    pub fn strategy_policy(mut self, strategy: CacheStrategy, policy: StrategyPolicy) -> Self {
        self.policies.set(strategy, policy);
        self
    }

    /// Register a cascade rule: when an entity of this type is invalidated,
    /// these key patterns and related entity types go with it.
    pub fn cascade_rule(mut self, entity: impl Into<String>, rule: CascadeRule) -> Self {
        self.cascades.insert(entity, rule);
        self
    }

    /// Propagate invalidations to other instances over the store's
    /// publish/subscribe channel. Off by default.
    pub fn enable_fanout(mut self) -> Self {
        self.fanout.enabled = true;
        self
    }

    /// Channel name used for invalidation fan-out.
    pub fn fanout_channel(mut self, channel: impl Into<String>) -> Self {
        self.fanout.channel = channel.into();
        self
    }

    /// Replace the request allowance for one identity category.
    pub fn category_limit(mut self, category: Category, limit: CategoryLimit) -> Self {
        self.limits.set(category, limit);
        self
    }

    /// Weight one endpoint's allowance. Values below 1.0 tighten the limit,
    /// above 1.0 relax it.
    pub fn endpoint_multiplier(mut self, endpoint: impl Into<String>, multiplier: f64) -> Self {
        self.multipliers.set(endpoint, multiplier);
        self
    }

    /// Replace the whole endpoint weight table, discarding the defaults.
    pub fn endpoint_multipliers(mut self, multipliers: EndpointMultipliers) -> Self {
        self.multipliers = multipliers;
        self
    }

    /// Enable proactive warming: `source` names the keys worth preloading,
    /// `loader` produces their values.
    pub fn warmer(
        mut self,
        source: Arc<dyn PopularitySource>,
        loader: Arc<dyn CacheLoader>,
        config: WarmerConfig,
    ) -> Self {
        self.warmer = Some(WarmerParts {
            source,
            loader,
            config,
        });
        self
    }

    /// How often the local tier sweeps expired entries.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// How often stale limiter fallback windows are purged.
    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// How long a suspicion marker keeps an identity in the suspicious
    /// category after its last limit violation.
    pub fn suspicious_ttl(mut self, ttl: Duration) -> Self {
        self.suspicious_ttl = ttl;
        self
    }

    /// Validate the configuration and assemble the gate.
    ///
    /// # Errors
    ///
    /// Fails on an invalid policy table (zero TTLs or capacities), a
    /// malformed or cyclic cascade rule, a non-positive endpoint multiplier,
    /// or when no store was supplied and Redis cannot be reached.
    pub async fn build(self) -> Result<AdaptiveGate> {
        self.policies
            .validate()
            .context("invalid cache strategy policies")?;
        self.cascades.validate().context("invalid cascade rules")?;
        self.limits.validate().context("invalid category limits")?;
        self.multipliers
            .validate()
            .context("invalid endpoint multipliers")?;

        let store: Arc<dyn DistributedStore> = match self.store {
            Some(store) => store,
            None => match &self.redis_url {
                Some(url) => Arc::new(
                    RedisStore::with_url(url)
                        .await
                        .context("redis connection failed")?,
                ),
                None => Arc::new(RedisStore::connect().await.context("redis connection failed")?),
            },
        };

        // One id per gate: fan-out events from this instance are ignored by
        // its own subscriber, and the warm lock records who holds it.
        let instance_id = Uuid::new_v4();

        let cache = Arc::new(TieredCache::new(
            Arc::clone(&store),
            self.policies,
            self.cascades,
            self.fanout,
            instance_id,
            self.sweep_interval,
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            PolicyResolver::new(self.limits, self.multipliers),
            self.suspicious_ttl,
            self.purge_interval,
        ));
        let warmer = self.warmer.map(|parts| {
            Arc::new(CacheWarmer::new(
                Arc::clone(&cache),
                Arc::clone(&store),
                parts.source,
                parts.loader,
                parts.config,
                instance_id,
            ))
        });

        info!(instance = %instance_id, "adaptive gate assembled");
        Ok(AdaptiveGate {
            cache,
            limiter,
            warmer,
            store,
        })
    }
}

impl Default for AdaptiveGateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn builds_with_a_memory_store() {
        let gate = AdaptiveGateBuilder::new()
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap();
        assert!(gate.health_check().await);
    }

    #[tokio::test]
    async fn rejects_a_zero_ttl_policy() {
        let result = AdaptiveGateBuilder::new()
            .with_store(Arc::new(MemoryStore::new()))
            .strategy_policy(
                CacheStrategy::Hot,
                StrategyPolicy {
                    ttl: Duration::ZERO,
                    ..StrategyPolicy::default_for(CacheStrategy::Hot)
                },
            )
            .build()
            .await;
        let message = result.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(message.contains("strategy policies"), "got: {message}");
    }

    #[tokio::test]
    async fn rejects_a_cascade_cycle() {
        let result = AdaptiveGateBuilder::new()
            .with_store(Arc::new(MemoryStore::new()))
            .cascade_rule(
                "project",
                CascadeRule::new(vec!["project:*".into()], vec!["image".into()]),
            )
            .cascade_rule(
                "image",
                CascadeRule::new(vec!["image:*".into()], vec!["project".into()]),
            )
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_a_non_positive_multiplier() {
        let result = AdaptiveGateBuilder::new()
            .with_store(Arc::new(MemoryStore::new()))
            .endpoint_multiplier("api/auth", 0.0)
            .build()
            .await;
        assert!(result.is_err());
    }
}
