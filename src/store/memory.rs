//! In-process store backend.
//!
//! Implements the same keyspace semantics as the Redis backend (lazy TTL
//! expiry, glob scans, atomic-enough batches) over `DashMap`, so the cache
//! and limiter behave identically when no shared store is deployed. Tests
//! use [`MemoryStore::set_offline`] to simulate a store outage and exercise
//! the degraded paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{key_matches, DistributedStore, TtlState, WindowSlide};
use crate::error::StoreError;

const CHANNEL_CAPACITY: usize = 64;

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

struct WindowEntry {
    members: BTreeSet<(u64, String)>,
    expires_at: Instant,
}

/// Process-local [`DistributedStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    kv: DashMap<String, KvEntry>,
    hashes: DashMap<String, HashMap<String, String>>,
    windows: DashMap<String, WindowEntry>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: while offline, every operation fails with a
    /// connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Connection("simulated store outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn window_is_live(entry: &WindowEntry) -> bool {
        Instant::now() < entry.expires_at
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_online()?;
        if let Some(entry) = self.kv.get(key) {
            if entry.is_live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.kv.remove_if(key, |_, entry| !entry.is_live());
        Ok(None)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.check_online()?;
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let fresh = KvEntry {
            value: value.as_bytes().to_vec(),
            expires_at: Some(Instant::now() + ttl),
        };
        match self.kv.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_live() => {
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.kv.remove(key);
        self.hashes.remove(key);
        self.windows.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut removed = 0;
        for key in keys {
            let was_kv = self.kv.remove(key).is_some_and(|(_, e)| e.is_live());
            let was_hash = self.hashes.remove(key).is_some();
            let was_window = self
                .windows
                .remove(key)
                .is_some_and(|(_, e)| Self::window_is_live(&e));
            if was_kv || was_hash || was_window {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let mut keys = Vec::new();
        for entry in &self.kv {
            if entry.value().is_live() && key_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in &self.hashes {
            if key_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in &self.windows {
            if Self::window_is_live(entry.value()) && key_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let kv_live = self.kv.get(key).is_some_and(|e| e.is_live());
        let hash_live = self.hashes.contains_key(key);
        let window_live = self
            .windows
            .get(key)
            .is_some_and(|e| Self::window_is_live(&e));
        Ok(kv_live || hash_live || window_live)
    }

    async fn ttl_state(&self, key: &str) -> Result<TtlState, StoreError> {
        self.check_online()?;
        if let Some(entry) = self.kv.get(key) {
            if entry.is_live() {
                return Ok(match entry.expires_at {
                    Some(at) => TtlState::Remaining(at.saturating_duration_since(Instant::now())),
                    None => TtlState::NoExpiry,
                });
            }
        }
        if self.hashes.contains_key(key) {
            return Ok(TtlState::NoExpiry);
        }
        if let Some(entry) = self.windows.get(key) {
            if Self::window_is_live(&entry) {
                return Ok(TtlState::Remaining(
                    entry.expires_at.saturating_duration_since(Instant::now()),
                ));
            }
        }
        Ok(TtlState::Missing)
    }

    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.check_online()?;
        let mut entry = self.kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: b"0".to_vec(),
            expires_at: None,
        });
        let current = if entry.is_live() {
            std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0)
        } else {
            0
        };
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(next)
    }

    async fn hash_incr_many(
        &self,
        key: &str,
        deltas: &[(&str, i64)],
    ) -> Result<Vec<i64>, StoreError> {
        self.check_online()?;
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let mut values = Vec::with_capacity(deltas.len());
        for (field, delta) in deltas {
            let current = hash
                .get(*field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let next = current + delta;
            hash.insert((*field).to_string(), next.to_string());
            values.push(next);
        }
        Ok(values)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_online()?;
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }

    async fn window_slide(
        &self,
        key: &str,
        window_start_ms: u64,
        now_ms: u64,
        member: &str,
        ttl: Duration,
    ) -> Result<WindowSlide, StoreError> {
        self.check_online()?;
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                members: BTreeSet::new(),
                expires_at: Instant::now() + ttl,
            });
        if !Self::window_is_live(&entry) {
            entry.members.clear();
        }
        entry.members.retain(|(ms, _)| *ms > window_start_ms);
        entry.members.insert((now_ms, member.to_string()));
        entry.expires_at = Instant::now() + ttl;
        let count = entry.members.len() as u64;
        let oldest_ms = entry.members.first().map(|(ms, _)| *ms);
        Ok(WindowSlide { count, oldest_ms })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check_online()?;
        // A send error just means nobody is subscribed.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        self.check_online()?;
        let receiver = self.sender_for(channel).subscribe();
        let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }
}
