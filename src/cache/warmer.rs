//! Scheduled cache warming.
//!
//! A periodic pass asks the [`PopularitySource`] for the keys worth having
//! and fills the ones that are missing through the [`CacheLoader`]. Before
//! each pass the warmer takes a short-lived store-side lock so only one
//! instance of the fleet does the work; losing the lock just skips the pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::strategy::CacheStrategy;
use super::tiered::TieredCache;
use crate::store::DistributedStore;

const WARM_LOCK_KEY: &str = "cache:warm:lock";

/// Supplies the keys worth warming, most popular first.
#[async_trait]
pub trait PopularitySource: Send + Sync {
    /// Up to `limit` keys, ordered by how much a warm copy is worth.
    async fn top_keys(&self, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// Produces the value for a key the warmer decided to fill.
#[async_trait]
pub trait CacheLoader: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone)]
pub struct WarmerConfig {
    /// Time between warming passes.
    pub interval: Duration,
    /// How many keys to ask the popularity source for.
    pub top_keys: usize,
    /// Strategy warmed entries are cached under.
    pub strategy: CacheStrategy,
    /// Lifetime of the cross-instance warm lock. Must be shorter than
    /// `interval` or every second pass is skipped.
    pub lock_ttl: Duration,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            top_keys: 20,
            strategy: CacheStrategy::Hot,
            lock_ttl: Duration::from_secs(60),
        }
    }
}

/// Counters for warming activity.
#[derive(Debug, Clone, Serialize)]
pub struct WarmerStats {
    pub passes: u64,
    pub keys_warmed: u64,
}

/// Periodic warm-fill of popular keys.
pub struct CacheWarmer {
    cache: Arc<TieredCache>,
    store: Arc<dyn DistributedStore>,
    source: Arc<dyn PopularitySource>,
    loader: Arc<dyn CacheLoader>,
    config: WarmerConfig,
    instance_id: Uuid,
    passes: AtomicU64,
    keys_warmed: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

impl CacheWarmer {
    pub(crate) fn new(
        cache: Arc<TieredCache>,
        store: Arc<dyn DistributedStore>,
        source: Arc<dyn PopularitySource>,
        loader: Arc<dyn CacheLoader>,
        config: WarmerConfig,
        instance_id: Uuid,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cache,
            store,
            source,
            loader,
            config,
            instance_id,
            passes: AtomicU64::new(0),
            keys_warmed: AtomicU64::new(0),
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Run one warming pass now. Returns how many keys were filled; a pass
    /// skipped because another instance holds the lock returns zero.
    pub async fn warm_once(&self) -> usize {
        match self
            .store
            .set_nx_ex(
                WARM_LOCK_KEY,
                &self.instance_id.to_string(),
                self.config.lock_ttl,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("another instance holds the warm lock, skipping pass");
                return 0;
            }
            Err(err) => {
                warn!(error = %err, "warm lock unavailable, skipping pass");
                return 0;
            }
        }

        let keys = match self.source.top_keys(self.config.top_keys).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "popularity source failed, skipping pass");
                return 0;
            }
        };

        let mut warmed = 0;
        for key in keys {
            if self.cache.contains(&key).await {
                continue;
            }
            match self.loader.load(&key).await {
                Ok(value) => {
                    self.cache.set(&key, value, self.config.strategy).await;
                    warmed += 1;
                }
                Err(err) => {
                    // One bad key must not starve the rest of the pass.
                    warn!(key = %key, error = %err, "warm load failed, leaving key cold");
                }
            }
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.keys_warmed.fetch_add(warmed as u64, Ordering::Relaxed);
        info!(warmed, "cache warm pass complete");
        warmed
    }

    /// Start periodic warming. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            // Spread instances out so they do not all race for the lock at
            // the same instant after a fleet-wide deploy.
            let jitter = this
                .config
                .interval
                .mul_f64(rand::thread_rng().gen_range(0.0..0.1));
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = shutdown_rx.recv() => return,
            }
            let mut ticker = tokio::time::interval(this.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.warm_once().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("cache warmer stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Signal the warming task to stop. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> WarmerStats {
        WarmerStats {
            passes: self.passes.load(Ordering::Relaxed),
            keys_warmed: self.keys_warmed.load(Ordering::Relaxed),
        }
    }
}
