//! Two-tier cache over the local tier and the distributed store.
//!
//! Reads go local-first, then to the store; store hits are backfilled into
//! the local tier with the TTL remaining from the envelope's creation time.
//! All store failures degrade: reads become misses, writes keep the local
//! copy, invalidations log and move on. `get_or_load` coalesces concurrent
//! loads per key so one loader feeds every waiter.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::envelope;
use super::invalidation::{substitute_id, CascadeTable, FanoutConfig, InvalidationEvent};
use super::local::LocalTier;
use super::strategy::{CacheStrategy, PolicyTable};
use crate::store::{now_ms, DistributedStore};

const STORE_PREFIX: &str = "cache:";
const SUBSCRIBER_RETRY: Duration = Duration::from_secs(5);

fn store_key(key: &str) -> String {
    format!("{STORE_PREFIX}{key}")
}

#[derive(Default)]
struct MetricsInner {
    hits: AtomicU64,
    local_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_swept: AtomicU64,
    loads: AtomicU64,
    coalesced_loads: AtomicU64,
    store_errors: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub local_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_swept: u64,
    pub loads: u64,
    pub coalesced_loads: u64,
    pub store_errors: u64,
    pub invalidations: u64,
    pub local_items: usize,
    pub memory_usage_bytes: usize,
}

impl CacheMetrics {
    /// Hit rate across both tiers, in `[0.0, 1.0]`.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Strategy-driven cache facade shared by every caller in the process.
pub struct TieredCache {
    store: Arc<dyn DistributedStore>,
    local: LocalTier,
    policies: PolicyTable,
    cascades: CascadeTable,
    fanout: FanoutConfig,
    instance_id: Uuid,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    metrics: MetricsInner,
    sweep_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

/// Removes the in-flight marker when the last coalesced loader finishes.
struct CleanupGuard<'a> {
    in_flight: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        // Two strong counts = the map's clone plus ours; nobody is waiting.
        self.in_flight
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl TieredCache {
    pub(crate) fn new(
        store: Arc<dyn DistributedStore>,
        policies: PolicyTable,
        cascades: CascadeTable,
        fanout: FanoutConfig,
        instance_id: Uuid,
        sweep_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            store,
            local: LocalTier::new(),
            policies,
            cascades,
            fanout,
            instance_id,
            in_flight: DashMap::new(),
            metrics: MetricsInner::default(),
            sweep_interval,
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Look up a key in the local tier, then the store. Store and decode
    /// failures are logged and surface as misses; this never errors.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.local.get(key) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.local_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        match self.store.get_bytes(&store_key(key)).await {
            Ok(Some(bytes)) => match envelope::decode(&bytes) {
                Ok(decoded) => {
                    self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    self.metrics.store_hits.fetch_add(1, Ordering::Relaxed);
                    self.backfill_local(key, &decoded);
                    Some(decoded.value)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "stored entry failed to decode, treating as miss");
                    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "store read failed, treating as miss");
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a value under a strategy. A store failure is logged and the
    /// local write still happens, so the instance that produced the value
    /// keeps serving it.
    pub async fn set(&self, key: &str, value: Value, strategy: CacheStrategy) {
        let policy = self.policies.policy(strategy);
        let encoded = match envelope::encode(&value, strategy, policy) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(key = %key, error = %err, "value could not be encoded, not cached");
                return;
            }
        };
        if let Err(err) = self.store.set_bytes(&store_key(key), &encoded.bytes, policy.ttl).await
        {
            warn!(key = %key, error = %err, "store write failed");
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
        }
        if policy.local_cacheable {
            let evicted = self.local.insert(
                key,
                value,
                strategy,
                policy.ttl,
                policy.max_local_items,
                encoded.serialized_len,
            );
            if evicted > 0 {
                self.metrics.evictions.fetch_add(evicted, Ordering::Relaxed);
                debug!(key = %key, evicted, strategy = %strategy, "local tier evicted to admit entry");
            }
        }
    }

    /// Fetch a key or produce it with `loader` and cache the result.
    /// Concurrent calls for the same key share one loader invocation.
    ///
    /// # Errors
    ///
    /// Returns the loader's error; cache-side failures never propagate.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        strategy: CacheStrategy,
        loader: F,
    ) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let _cleanup = CleanupGuard {
            in_flight: &self.in_flight,
            key,
        };

        // Someone else may have loaded the key while we waited for the lock.
        if let Some(value) = self.get(key).await {
            self.metrics.coalesced_loads.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        debug!(key = %key, strategy = %strategy, "cache miss, invoking loader");
        self.metrics.loads.fetch_add(1, Ordering::Relaxed);
        let value = loader()
            .await
            .with_context(|| format!("loader failed for key `{key}`"))?;
        self.set(key, value.clone(), strategy).await;
        Ok(value)
    }

    /// Typed wrapper over [`TieredCache::get_or_load`].
    ///
    /// # Errors
    ///
    /// Returns the loader's error, or a deserialization error when the
    /// cached value does not match `T`.
    pub async fn get_or_load_typed<T, F, Fut>(
        &self,
        key: &str,
        strategy: CacheStrategy,
        loader: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let value = self
            .get_or_load(key, strategy, || async move {
                let loaded = loader().await?;
                serde_json::to_value(&loaded).context("serializing loaded value for caching")
            })
            .await?;
        serde_json::from_value(value)
            .with_context(|| format!("cached value under `{key}` does not match the requested type"))
    }

    /// Drop one key from both tiers and tell sibling instances.
    pub async fn invalidate(&self, key: &str) {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        let removed_local = self.local.remove(key);
        if let Err(err) = self.store.delete(&store_key(key)).await {
            warn!(key = %key, error = %err, "store invalidation failed");
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
        }
        debug!(key = %key, removed_local, "invalidated key");
        self.publish_event(InvalidationEvent::Remove {
            origin: self.instance_id,
            key: key.to_string(),
        })
        .await;
    }

    /// Drop every key matching a glob pattern from both tiers. Returns a
    /// best-effort count of removed entries.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        let local_removed = self.local.remove_matching(pattern);
        let store_removed = match self.store.scan_keys(&store_key(pattern)).await {
            Ok(keys) if keys.is_empty() => 0,
            Ok(keys) => match self.store.delete_many(&keys).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "store pattern delete failed");
                    self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                    0
                }
            },
            Err(err) => {
                warn!(pattern = %pattern, error = %err, "store pattern scan failed");
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        info!(pattern = %pattern, local_removed, store_removed, "pattern invalidation");
        self.publish_event(InvalidationEvent::RemovePattern {
            origin: self.instance_id,
            pattern: pattern.to_string(),
        })
        .await;
        store_removed.max(local_removed)
    }

    /// Invalidate everything related to an entity: its own direct patterns,
    /// then the direct patterns of each cascade type, one level deep. An
    /// unknown entity type is a warning, not an error.
    pub async fn invalidate_related(&self, entity_type: &str, id: &str) {
        let Some(rule) = self.cascades.rule(entity_type) else {
            warn!(entity_type = %entity_type, "no cascade rule for entity type, nothing invalidated");
            return;
        };
        for pattern in &rule.direct_patterns {
            self.invalidate_pattern(&substitute_id(pattern, id)).await;
        }
        for target in &rule.cascade_types {
            if let Some(target_rule) = self.cascades.rule(target) {
                for pattern in &target_rule.direct_patterns {
                    self.invalidate_pattern(&substitute_id(pattern, id)).await;
                }
            }
        }
        debug!(entity_type = %entity_type, id = %id, "cascade invalidation complete");
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            local_hits: self.metrics.local_hits.load(Ordering::Relaxed),
            store_hits: self.metrics.store_hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            expired_swept: self.metrics.expired_swept.load(Ordering::Relaxed),
            loads: self.metrics.loads.load(Ordering::Relaxed),
            coalesced_loads: self.metrics.coalesced_loads.load(Ordering::Relaxed),
            store_errors: self.metrics.store_errors.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
            local_items: self.local.len(),
            memory_usage_bytes: self.local.memory_usage(),
        }
    }

    /// Start the expiry sweeper and, when fan-out is enabled, the
    /// invalidation subscriber. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_sweeper();
        if self.fanout.enabled {
            self.spawn_subscriber();
        }
    }

    /// Signal background tasks to stop. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) async fn contains(&self, key: &str) -> bool {
        if self.local.contains(key) {
            return true;
        }
        self.store.exists(&store_key(key)).await.unwrap_or(false)
    }

    pub(crate) fn local_probe(&self) -> bool {
        self.local.probe()
    }

    fn backfill_local(&self, key: &str, decoded: &envelope::DecodedEntry) {
        let policy = self.policies.policy(decoded.strategy);
        if !policy.local_cacheable {
            return;
        }
        let age_ms = now_ms().saturating_sub(decoded.created_at_ms);
        let remaining = policy.ttl.saturating_sub(Duration::from_millis(age_ms));
        if remaining.is_zero() {
            return;
        }
        let evicted = self.local.insert(
            key,
            decoded.value.clone(),
            decoded.strategy,
            remaining,
            policy.max_local_items,
            decoded.serialized_len,
        );
        if evicted > 0 {
            self.metrics.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    async fn publish_event(&self, event: InvalidationEvent) {
        if !self.fanout.enabled {
            return;
        }
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode invalidation event");
                return;
            }
        };
        if let Err(err) = self.store.publish(&self.fanout.channel, &payload).await {
            warn!(channel = %self.fanout.channel, error = %err, "invalidation fan-out failed");
            self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_event(&self, payload: &str) {
        let event: InvalidationEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring malformed invalidation event");
                return;
            }
        };
        match event {
            InvalidationEvent::Remove { origin, key } => {
                if origin == self.instance_id {
                    return;
                }
                let removed = self.local.remove(&key);
                debug!(key = %key, removed, "applied remote invalidation");
            }
            InvalidationEvent::RemovePattern { origin, pattern } => {
                if origin == self.instance_id {
                    return;
                }
                let removed = self.local.remove_matching(&pattern);
                debug!(pattern = %pattern, removed, "applied remote pattern invalidation");
            }
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = this.local.purge_expired();
                        if swept > 0 {
                            this.metrics.expired_swept.fetch_add(swept as u64, Ordering::Relaxed);
                            debug!(swept, "swept expired local entries");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("local tier sweeper stopped");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_subscriber(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!(channel = %this.fanout.channel, "invalidation subscriber started");
            loop {
                let mut stream = tokio::select! {
                    result = this.store.subscribe(&this.fanout.channel) => match result {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(error = %err, "invalidation subscription failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(SUBSCRIBER_RETRY) => continue,
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                };
                loop {
                    tokio::select! {
                        message = stream.next() => match message {
                            Some(payload) => this.apply_event(&payload),
                            None => {
                                warn!("invalidation stream ended, resubscribing");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            debug!("invalidation subscriber stopped");
                            return;
                        }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(SUBSCRIBER_RETRY) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("invalidation subscriber stopped");
        });
    }
}
