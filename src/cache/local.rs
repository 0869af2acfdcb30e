//! Process-local cache tier.
//!
//! A bounded map per strategy with insertion-order eviction: when a
//! strategy's slice would exceed its configured capacity, the
//! oldest-inserted entry goes first, and entries inserted in the same
//! millisecond are broken by lowest hit count. Expired entries are dropped
//! lazily on read and by a periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use super::strategy::CacheStrategy;
use crate::store::{key_matches, now_ms};

struct LocalEntry {
    value: Value,
    strategy: CacheStrategy,
    expires_at: Instant,
    seq: u64,
    hit_count: u64,
    approx_bytes: usize,
}

struct QueueSlot {
    key: String,
    seq: u64,
    inserted_at_ms: u64,
}

#[derive(Default)]
struct StrategyQueues {
    hot: VecDeque<QueueSlot>,
    warm: VecDeque<QueueSlot>,
    cold: VecDeque<QueueSlot>,
    static_: VecDeque<QueueSlot>,
}

impl StrategyQueues {
    fn queue_mut(&mut self, strategy: CacheStrategy) -> &mut VecDeque<QueueSlot> {
        match strategy {
            CacheStrategy::Hot => &mut self.hot,
            CacheStrategy::Warm => &mut self.warm,
            CacheStrategy::Cold => &mut self.cold,
            CacheStrategy::Static => &mut self.static_,
        }
    }
}

#[derive(Default)]
struct StrategyCounts {
    hot: usize,
    warm: usize,
    cold: usize,
    static_: usize,
}

impl StrategyCounts {
    fn get(&self, strategy: CacheStrategy) -> usize {
        match strategy {
            CacheStrategy::Hot => self.hot,
            CacheStrategy::Warm => self.warm,
            CacheStrategy::Cold => self.cold,
            CacheStrategy::Static => self.static_,
        }
    }

    fn slot_mut(&mut self, strategy: CacheStrategy) -> &mut usize {
        match strategy {
            CacheStrategy::Hot => &mut self.hot,
            CacheStrategy::Warm => &mut self.warm,
            CacheStrategy::Cold => &mut self.cold,
            CacheStrategy::Static => &mut self.static_,
        }
    }

    fn inc(&mut self, strategy: CacheStrategy) {
        *self.slot_mut(strategy) += 1;
    }

    fn dec(&mut self, strategy: CacheStrategy) {
        let slot = self.slot_mut(strategy);
        *slot = slot.saturating_sub(1);
    }
}

#[derive(Default)]
struct TierInner {
    entries: HashMap<String, LocalEntry>,
    queues: StrategyQueues,
    counts: StrategyCounts,
    /// Queue slots whose entry was removed or reinserted. Reclaimed by
    /// [`LocalTier::maintain_queue`] so the queues stay proportional to the
    /// live entry count.
    stale: StrategyCounts,
    next_seq: u64,
    bytes: usize,
}

/// Bounded local tier shared by all strategies, with per-strategy capacity
/// accounting.
#[derive(Default)]
pub(crate) struct LocalTier {
    inner: Mutex<TierInner>,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key, counting a hit. Expired entries are removed and
    /// reported as misses.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => Instant::now() >= entry.expires_at,
            None => return None,
        };
        if expired {
            Self::remove_locked(&mut inner, key);
            return None;
        }
        let entry = inner.entries.get_mut(key)?;
        entry.hit_count += 1;
        Some(entry.value.clone())
    }

    /// Presence check that leaves hit counts alone. Used by warming to skip
    /// keys that are already cached.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|entry| Instant::now() < entry.expires_at)
    }

    /// Insert a value, evicting within the strategy's capacity. Returns the
    /// number of entries evicted to make room.
    pub fn insert(
        &self,
        key: &str,
        value: Value,
        strategy: CacheStrategy,
        ttl: Duration,
        max_items: usize,
        approx_bytes: usize,
    ) -> u64 {
        self.insert_at(key, value, strategy, ttl, max_items, approx_bytes, now_ms())
    }

    /// Insert with an explicit insertion timestamp. Reinsertion of an
    /// existing key replaces its entry and resets its hit count; the old
    /// queue slot goes stale (skipped via its sequence number) and is
    /// reclaimed by queue maintenance.
    pub fn insert_at(
        &self,
        key: &str,
        value: Value,
        strategy: CacheStrategy,
        ttl: Duration,
        max_items: usize,
        approx_bytes: usize,
        inserted_at_ms: u64,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = LocalEntry {
            value,
            strategy,
            expires_at: Instant::now() + ttl,
            seq,
            hit_count: 0,
            approx_bytes,
        };
        let mut replaced = None;
        if let Some(old) = inner.entries.insert(key.to_string(), entry) {
            inner.bytes = inner.bytes.saturating_sub(old.approx_bytes);
            inner.counts.dec(old.strategy);
            inner.stale.inc(old.strategy);
            replaced = Some(old.strategy);
        }
        inner.bytes += approx_bytes;
        inner.counts.inc(strategy);
        inner.queues.queue_mut(strategy).push_back(QueueSlot {
            key: key.to_string(),
            seq,
            inserted_at_ms,
        });
        if let Some(old_strategy) = replaced.filter(|old| *old != strategy) {
            Self::maintain_queue(&mut inner, old_strategy);
        }
        Self::maintain_queue(&mut inner, strategy);

        let mut evicted = 0;
        while inner.counts.get(strategy) > max_items {
            if Self::evict_one(&mut inner, strategy).is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, key)
    }

    /// Remove every key matching a store glob pattern. Returns how many were
    /// removed.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| key_matches(pattern, key))
            .cloned()
            .collect();
        for key in &matching {
            Self::remove_locked(&mut inner, key);
        }
        matching.len()
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            Self::remove_locked(&mut inner, key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn len_for(&self, strategy: CacheStrategy) -> usize {
        self.inner.lock().counts.get(strategy)
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.lock().bytes
    }

    #[cfg(test)]
    fn queue_len(&self, strategy: CacheStrategy) -> usize {
        let mut inner = self.inner.lock();
        inner.queues.queue_mut(strategy).len()
    }

    /// Insert/read/remove round trip used by health checks.
    pub fn probe(&self) -> bool {
        let key = "__local_probe__";
        self.insert(
            key,
            Value::Bool(true),
            CacheStrategy::Hot,
            Duration::from_secs(1),
            usize::MAX,
            1,
        );
        let ok = self.get(key).is_some();
        self.remove(key);
        ok
    }

    fn remove_locked(inner: &mut TierInner, key: &str) -> bool {
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.bytes = inner.bytes.saturating_sub(entry.approx_bytes);
                inner.counts.dec(entry.strategy);
                inner.stale.inc(entry.strategy);
                Self::maintain_queue(inner, entry.strategy);
                true
            }
            None => false,
        }
    }

    /// Reclaim stale queue slots: pop them off the front, and once stale
    /// slots outnumber live ones rebuild the queue without them. Amortized
    /// O(1) per insert or removal; keeps each queue proportional to its
    /// strategy's live entry count.
    fn maintain_queue(inner: &mut TierInner, strategy: CacheStrategy) {
        let TierInner {
            entries,
            queues,
            stale,
            ..
        } = inner;
        let queue = queues.queue_mut(strategy);
        while let Some(front) = queue.front() {
            let live = entries
                .get(&front.key)
                .is_some_and(|entry| entry.seq == front.seq);
            if live {
                break;
            }
            queue.pop_front();
            stale.dec(strategy);
        }
        if stale.get(strategy) > queue.len() / 2 {
            queue.retain(|slot| {
                entries
                    .get(&slot.key)
                    .is_some_and(|entry| entry.seq == slot.seq)
            });
            *stale.slot_mut(strategy) = 0;
        }
    }

    /// Evict one entry from a strategy's slice: oldest insertion timestamp
    /// first, lowest hit count among entries sharing that timestamp.
    fn evict_one(inner: &mut TierInner, strategy: CacheStrategy) -> Option<String> {
        let TierInner {
            entries,
            queues,
            counts,
            stale,
            bytes,
            ..
        } = inner;
        let queue = queues.queue_mut(strategy);

        // Clear stale slots (removed or reinserted keys) off the front.
        while let Some(front) = queue.front() {
            let live = entries
                .get(&front.key)
                .is_some_and(|entry| entry.seq == front.seq);
            if live {
                break;
            }
            queue.pop_front();
            stale.dec(strategy);
        }
        let oldest_ms = queue.front()?.inserted_at_ms;

        let mut victim_idx = 0;
        let mut victim_hits = u64::MAX;
        for (idx, slot) in queue.iter().enumerate() {
            if slot.inserted_at_ms != oldest_ms {
                break;
            }
            if let Some(entry) = entries.get(&slot.key) {
                if entry.seq == slot.seq && entry.hit_count < victim_hits {
                    victim_hits = entry.hit_count;
                    victim_idx = idx;
                }
            }
        }

        let slot = queue.remove(victim_idx)?;
        let entry = entries.remove(&slot.key)?;
        *bytes = bytes.saturating_sub(entry.approx_bytes);
        counts.dec(strategy);
        Some(slot.key)
    }
}
