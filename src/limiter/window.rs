//! Sliding request window, with a process-local fallback.
//!
//! The normal path is one atomic store batch per check: prune expired
//! entries, insert this request, read the count and the oldest survivor.
//! When the store is unreachable the check degrades to a fixed window kept
//! in process memory, which still bounds abusive traffic per instance until
//! the store returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use super::behavior::BehaviorMetrics;
use super::policy::EffectiveLimit;
use super::{keys, Identity};
use crate::store::{now_ms, DistributedStore};

/// Window keys outlive the window itself by this much, so an idle window
/// expires on its own instead of lingering forever.
const WINDOW_TTL_BUFFER: Duration = Duration::from_secs(5);

/// Behavior thresholds that escalate a rate violation into a block.
#[must_use]
pub fn should_block(behavior: &BehaviorMetrics) -> bool {
    behavior.failed_auth_attempts > 10
        || (behavior.error_rate > 0.8 && behavior.rapid_requests > 20)
        || behavior.rapid_requests > 50
}

/// Result of counting one request into a window.
pub(crate) struct WindowCheck {
    /// Requests in the window, including this one.
    pub count: u64,
    /// When the oldest windowed request leaves the window (epoch ms).
    pub reset_at_ms: u64,
    /// True when the count came from the local fallback.
    pub degraded: bool,
}

struct FixedWindow {
    count: u64,
    reset_at_ms: u64,
    window_ms: u64,
}

pub(crate) struct SlidingWindow {
    store: Arc<dyn DistributedStore>,
    fallback: DashMap<String, FixedWindow>,
    degraded_checks: AtomicU64,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self {
            store,
            fallback: DashMap::new(),
            degraded_checks: AtomicU64::new(0),
        }
    }

    /// Count this request into the identity's per-endpoint window.
    pub async fn check(
        &self,
        identity: &Identity,
        endpoint: &str,
        limit: &EffectiveLimit,
    ) -> WindowCheck {
        let key = keys::requests(identity, endpoint);
        let now = now_ms();
        let window_ms = limit.window.as_millis() as u64;
        // Unique member even when two requests land in the same millisecond.
        let member = format!("{now}-{}", Uuid::new_v4());

        match self
            .store
            .window_slide(
                &key,
                now.saturating_sub(window_ms),
                now,
                &member,
                limit.window + WINDOW_TTL_BUFFER,
            )
            .await
        {
            Ok(slide) => {
                let oldest = slide.oldest_ms.unwrap_or(now);
                WindowCheck {
                    count: slide.count,
                    reset_at_ms: oldest + window_ms,
                    degraded: false,
                }
            }
            Err(err) => {
                self.degraded_checks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    identity = %identity,
                    endpoint = %endpoint,
                    error = %err,
                    "window check failed, counting in local fallback"
                );
                self.check_fallback(&key, window_ms, now)
            }
        }
    }

    fn check_fallback(&self, key: &str, window_ms: u64, now: u64) -> WindowCheck {
        let mut entry = self
            .fallback
            .entry(key.to_string())
            .or_insert_with(|| FixedWindow {
                count: 0,
                reset_at_ms: now + window_ms,
                window_ms,
            });
        if now >= entry.reset_at_ms {
            entry.count = 0;
            entry.reset_at_ms = now + window_ms;
        }
        entry.window_ms = window_ms;
        entry.count += 1;
        WindowCheck {
            count: entry.count,
            reset_at_ms: entry.reset_at_ms,
            degraded: true,
        }
    }

    /// Drop fallback windows idle for more than two window lengths. Run
    /// periodically so a store outage does not leave counters behind
    /// forever.
    pub fn purge_stale_fallback(&self) -> usize {
        let now = now_ms();
        let before = self.fallback.len();
        self.fallback
            .retain(|_, window| now < window.reset_at_ms + 2 * window.window_ms);
        before.saturating_sub(self.fallback.len())
    }

    /// Forget local fallback counts for one identity, across endpoints.
    pub fn clear_fallback_for(&self, identity: &Identity) {
        let prefix = keys::requests_prefix(identity);
        self.fallback.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    pub fn degraded_checks(&self) -> u64 {
        self.degraded_checks.load(Ordering::Relaxed)
    }
}
