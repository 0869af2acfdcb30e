//! Behavior-aware rate limiting.
//!
//! Every identity carries a behavior profile in the shared store. Each
//! evaluation reads that profile, places the identity in a category, adjusts
//! the category's allowance for the endpoint and for recent misbehavior, and
//! then counts the request into a sliding window. Identities that cross hard
//! misbehavior thresholds are blocked outright for the category's block
//! duration.
//!
//! The limiter fails open on store trouble: blocks become invisible, windows
//! fall back to per-instance fixed counters, and behavior reads come back
//! zeroed. Degraded decisions are marked so callers can observe the mode.

pub mod behavior;
mod blocker;
pub mod policy;
mod window;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::store::{now_ms, DistributedStore};

pub use behavior::BehaviorMetrics;
use behavior::BehaviorTracker;
use blocker::Blocker;
pub use policy::{
    categorize, Category, CategoryLimit, EffectiveLimit, EndpointMultipliers, LimitTable,
    PolicyResolver,
};
pub use window::should_block;
use window::SlidingWindow;

/// Who is making the request.
///
/// Authenticated callers are identified by their user id; anonymous callers
/// by whatever stable handle the embedder has, typically a client address.
/// Anonymous identities never reach the power-user category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    id: String,
    anonymous: bool,
}

impl Identity {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            anonymous: false,
        }
    }

    pub fn anonymous(handle: impl Into<String>) -> Self {
        Self {
            id: handle.into(),
            anonymous: true,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Store key layout for limiter state, one namespace per concern.
pub(crate) mod keys {
    use super::Identity;

    pub fn requests(identity: &Identity, endpoint: &str) -> String {
        format!("ratelimit:requests:{}:{endpoint}", identity.as_str())
    }

    pub fn requests_prefix(identity: &Identity) -> String {
        format!("ratelimit:requests:{}:", identity.as_str())
    }

    pub fn blocked(identity: &Identity) -> String {
        format!("ratelimit:blocked:{}", identity.as_str())
    }

    pub fn behavior(identity: &Identity) -> String {
        format!("ratelimit:behavior:{}", identity.as_str())
    }

    pub fn rapid(identity: &Identity) -> String {
        format!("ratelimit:rapid:{}", identity.as_str())
    }

    pub fn suspicious(identity: &Identity) -> String {
        format!("ratelimit:suspicious:{}", identity.as_str())
    }
}

/// Outcome of one rate-limit evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub category: Category,
    /// Effective request allowance for this window.
    pub limit: u32,
    /// Requests left in the window after this one.
    pub remaining: u32,
    /// When the window frees a slot again (epoch ms).
    pub reset_at_ms: u64,
    /// How long a denied caller should wait before retrying.
    pub retry_after: Duration,
    /// True when the denial came from a block rather than the window.
    pub blocked: bool,
    /// True when the store was unreachable and the count came from the
    /// local fallback window.
    pub degraded: bool,
}

impl RateDecision {
    /// Retry delay in whole seconds, rounded up and never zero for a
    /// denied request.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_millis().div_ceil(1000);
        u64::try_from(secs).unwrap_or(u64::MAX)
    }
}

/// Point-in-time view of an identity, for dashboards and support tooling.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub category: Category,
    pub blocked: bool,
    pub block_remaining: Option<Duration>,
    pub behavior: BehaviorMetrics,
    /// Baseline allowance for the category, before endpoint weighting.
    pub quota: EffectiveLimit,
}

/// Counters since the limiter was created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LimiterMetrics {
    pub evaluations: u64,
    pub allowed: u64,
    pub limited: u64,
    /// Requests rejected because an active block was found.
    pub blocked_hits: u64,
    /// Blocks issued by behavior thresholds.
    pub blocks_issued: u64,
    /// Window checks answered by the local fallback.
    pub degraded_checks: u64,
    /// Live entries in the local fallback.
    pub fallback_windows: u64,
}

#[derive(Default)]
struct MetricsInner {
    evaluations: AtomicU64,
    allowed: AtomicU64,
    limited: AtomicU64,
    blocked_hits: AtomicU64,
    blocks_issued: AtomicU64,
}

/// Rate limiter over the shared store. Cheap to share behind an [`Arc`];
/// one instance serves every endpoint.
pub struct RateLimiter {
    tracker: BehaviorTracker,
    window: SlidingWindow,
    blocker: Blocker,
    resolver: PolicyResolver,
    metrics: MetricsInner,
    purge_interval: Duration,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl RateLimiter {
    pub(crate) fn new(
        store: Arc<dyn DistributedStore>,
        resolver: PolicyResolver,
        suspicious_ttl: Duration,
        purge_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tracker: BehaviorTracker::new(store.clone()),
            window: SlidingWindow::new(store.clone()),
            blocker: Blocker::new(store, suspicious_ttl),
            resolver,
            metrics: MetricsInner::default(),
            purge_interval,
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Decide whether this request may proceed, and count it if so.
    ///
    /// The order matters: an active block wins over everything, behavior
    /// thresholds are checked before the window so a burst of failed logins
    /// blocks even a caller with quota to spare, and only then is the
    /// request counted against the sliding window.
    pub async fn evaluate(&self, identity: &Identity, endpoint: &str) -> RateDecision {
        self.metrics.evaluations.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();

        if let Some(remaining) = self.blocker.remaining(identity).await {
            self.metrics.blocked_hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                identity = %identity,
                endpoint = %endpoint,
                remaining_secs = remaining.as_secs(),
                "request rejected, identity is blocked"
            );
            return Self::blocked_decision(now, remaining);
        }

        let behavior = self.tracker.read(identity).await;
        let suspicious = self.blocker.is_suspicious(identity).await;
        let category = categorize(identity, &behavior, false, suspicious);
        let limit = self.resolver.compute_limit(category, endpoint, &behavior);

        if should_block(&behavior) {
            warn!(
                identity = %identity,
                category = %category,
                failed_auth = behavior.failed_auth_attempts,
                error_rate = behavior.error_rate,
                rapid = behavior.rapid_requests,
                "behavior crossed blocking thresholds"
            );
            self.blocker.block(identity, limit.block_duration).await;
            self.metrics.blocks_issued.fetch_add(1, Ordering::Relaxed);
            return Self::blocked_decision(now, limit.block_duration);
        }

        let check = self.window.check(identity, endpoint, &limit).await;
        let retry_after = Duration::from_millis(check.reset_at_ms.saturating_sub(now));

        if check.count > u64::from(limit.max_requests) {
            self.metrics.limited.fetch_add(1, Ordering::Relaxed);
            self.blocker.mark_suspicious(identity).await;
            debug!(
                identity = %identity,
                endpoint = %endpoint,
                category = %limit.category,
                count = check.count,
                limit = limit.max_requests,
                "request rejected, window limit exceeded"
            );
            return RateDecision {
                allowed: false,
                category: limit.category,
                limit: limit.max_requests,
                remaining: 0,
                reset_at_ms: check.reset_at_ms,
                retry_after: retry_after.max(Duration::from_secs(1)),
                blocked: false,
                degraded: check.degraded,
            };
        }

        self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        let used = u32::try_from(check.count).unwrap_or(u32::MAX);
        RateDecision {
            allowed: true,
            category: limit.category,
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(used),
            reset_at_ms: check.reset_at_ms,
            retry_after,
            blocked: false,
            degraded: check.degraded,
        }
    }

    fn blocked_decision(now: u64, remaining: Duration) -> RateDecision {
        RateDecision {
            allowed: false,
            category: Category::Blocked,
            limit: 0,
            remaining: 0,
            reset_at_ms: now + remaining.as_millis() as u64,
            retry_after: remaining.max(Duration::from_secs(1)),
            blocked: true,
            degraded: false,
        }
    }

    /// Feed the outcome of a completed request back into the identity's
    /// behavior profile. Call after the response is known.
    pub async fn record_outcome(&self, identity: &Identity, success: bool, status: u16) {
        self.tracker.record(identity, success, status).await;
    }

    /// Current standing of an identity without counting a request.
    pub async fn status(&self, identity: &Identity) -> IdentityStatus {
        let block_remaining = self.blocker.remaining(identity).await;
        let behavior = self.tracker.read(identity).await;
        let suspicious = self.blocker.is_suspicious(identity).await;
        let category = categorize(identity, &behavior, block_remaining.is_some(), suspicious);
        let quota = self.resolver.baseline_limit(category, &behavior);
        IdentityStatus {
            category,
            blocked: block_remaining.is_some(),
            block_remaining,
            behavior,
            quota,
        }
    }

    /// Forgive an identity: drop its block, suspicion marker, behavior
    /// profile and request windows. Returns false when part of the cleanup
    /// failed and should be retried.
    pub async fn reset_identity(&self, identity: &Identity) -> bool {
        let complete = self.blocker.reset(identity).await;
        self.window.clear_fallback_for(identity);
        complete
    }

    #[must_use]
    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            evaluations: self.metrics.evaluations.load(Ordering::Relaxed),
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
            blocked_hits: self.metrics.blocked_hits.load(Ordering::Relaxed),
            blocks_issued: self.metrics.blocks_issued.load(Ordering::Relaxed),
            degraded_checks: self.window.degraded_checks(),
            fallback_windows: self.window.fallback_len() as u64,
        }
    }

    /// Start the fallback purge task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let limiter = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(limiter.purge_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = limiter.window.purge_stale_fallback();
                        if purged > 0 {
                            debug!(purged, "purged stale fallback windows");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the purge task. Idempotent.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}
