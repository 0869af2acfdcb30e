//! Per-identity behavior tracking.
//!
//! Outcomes are folded into a store-side hash per identity plus a short
//! rapid-fire counter. A missing record and an unreachable store read the
//! same way: zeroed metrics. Evaluation must never fail because tracking
//! did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use super::{keys, Identity};
use crate::store::{now_ms, DistributedStore};

const RAPID_WINDOW: Duration = Duration::from_secs(10);
const MS_PER_DAY: u64 = 86_400_000;

const F_SUCCESSFUL: &str = "successful_requests";
const F_FAILED_AUTH: &str = "failed_auth_attempts";
const F_TOTAL: &str = "total_requests";
const F_ERRORS: &str = "error_requests";
const F_ERROR_RATE: &str = "error_rate";
const F_FIRST_SEEN: &str = "first_seen_ms";

/// Snapshot of what the store knows about one identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BehaviorMetrics {
    /// Requests seen in the last ten seconds.
    pub rapid_requests: u64,
    pub failed_auth_attempts: u64,
    /// error_requests / total_requests, as of the last recorded outcome.
    pub error_rate: f64,
    pub successful_requests: u64,
    pub total_requests: u64,
    /// Days since the identity was first seen.
    pub account_age_days: u64,
}

/// Writes and reads behavior records in the shared store.
pub struct BehaviorTracker {
    store: Arc<dyn DistributedStore>,
}

impl BehaviorTracker {
    pub(crate) fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    /// Fold one finished request into the identity's record: bump the rapid
    /// counter, the outcome counters, the derived error rate, and stamp
    /// first-seen if this is a new identity. All failures are logged and
    /// swallowed.
    pub async fn record(&self, identity: &Identity, success: bool, status: u16) {
        if let Err(err) = self
            .store
            .incr_expire(&keys::rapid(identity), RAPID_WINDOW)
            .await
        {
            warn!(identity = %identity, error = %err, "rapid counter update failed");
        }

        let behavior_key = keys::behavior(identity);
        let auth_failure = !success && (status == 401 || status == 403);
        let deltas = [
            (F_TOTAL, 1),
            (F_SUCCESSFUL, i64::from(success)),
            (F_FAILED_AUTH, i64::from(auth_failure)),
            (F_ERRORS, i64::from(status >= 400)),
        ];
        let totals = match self.store.hash_incr_many(&behavior_key, &deltas).await {
            Ok(values) => values,
            Err(err) => {
                warn!(identity = %identity, error = %err, "behavior update failed");
                return;
            }
        };
        let (total, errors) = match totals.as_slice() {
            [total, _, _, errors] => (*total, *errors),
            _ => {
                warn!(identity = %identity, "unexpected behavior update reply shape");
                return;
            }
        };

        if total > 0 {
            let rate = errors as f64 / total as f64;
            if let Err(err) = self
                .store
                .hash_set(&behavior_key, F_ERROR_RATE, &format!("{rate:.6}"))
                .await
            {
                warn!(identity = %identity, error = %err, "error rate update failed");
            }
        }
        if let Err(err) = self
            .store
            .hash_set_nx(&behavior_key, F_FIRST_SEEN, &now_ms().to_string())
            .await
        {
            warn!(identity = %identity, error = %err, "first-seen stamp failed");
        }
    }

    /// Read the identity's stored behavior, zeroed when absent or when the
    /// store is unreachable.
    pub async fn read(&self, identity: &Identity) -> BehaviorMetrics {
        let fields = match self.store.hash_get_all(&keys::behavior(identity)).await {
            Ok(fields) => fields,
            Err(err) => {
                warn!(identity = %identity, error = %err, "behavior read failed, assuming no history");
                return BehaviorMetrics::default();
            }
        };

        let rapid_requests = match self.store.get_bytes(&keys::rapid(identity)).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            Ok(None) | Err(_) => 0,
        };

        let first_seen_ms = field_u64(&fields, F_FIRST_SEEN);
        let account_age_days = if first_seen_ms == 0 {
            0
        } else {
            now_ms().saturating_sub(first_seen_ms) / MS_PER_DAY
        };

        BehaviorMetrics {
            rapid_requests,
            failed_auth_attempts: field_u64(&fields, F_FAILED_AUTH),
            error_rate: fields
                .get(F_ERROR_RATE)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            successful_requests: field_u64(&fields, F_SUCCESSFUL),
            total_requests: field_u64(&fields, F_TOTAL),
            account_age_days,
        }
    }
}

fn field_u64(fields: &HashMap<String, String>, name: &str) -> u64 {
    fields.get(name).and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> (Arc<MemoryStore>, BehaviorTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = BehaviorTracker::new(store.clone());
        (store, tracker)
    }

    #[tokio::test]
    async fn successes_accumulate() {
        let (_, tracker) = tracker();
        let identity = Identity::user("u1");
        tracker.record(&identity, true, 200).await;
        tracker.record(&identity, true, 200).await;

        let metrics = tracker.read(&identity).await;
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_auth_attempts, 0);
        assert!(metrics.error_rate.abs() < f64::EPSILON);
        assert_eq!(metrics.rapid_requests, 2);
        assert_eq!(metrics.account_age_days, 0);
    }

    #[tokio::test]
    async fn auth_failures_count_separately_from_errors() {
        let (_, tracker) = tracker();
        let identity = Identity::user("u2");
        tracker.record(&identity, true, 200).await;
        tracker.record(&identity, false, 401).await;
        tracker.record(&identity, false, 500).await;

        let metrics = tracker.read(&identity).await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_auth_attempts, 1);
        // 401 and 500 are both error outcomes.
        assert!((metrics.error_rate - 2.0 / 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_identity_reads_zeroed() {
        let (_, tracker) = tracker();
        let metrics = tracker.read(&Identity::user("nobody")).await;
        assert_eq!(metrics, BehaviorMetrics::default());
    }

    #[tokio::test]
    async fn store_outage_reads_zeroed_and_swallows_writes() {
        let (store, tracker) = tracker();
        let identity = Identity::user("u3");
        store.set_offline(true);
        tracker.record(&identity, true, 200).await;
        assert_eq!(tracker.read(&identity).await, BehaviorMetrics::default());

        store.set_offline(false);
        assert_eq!(tracker.read(&identity).await, BehaviorMetrics::default());
    }

    #[tokio::test]
    async fn first_seen_is_stamped_once() {
        let (store, tracker) = tracker();
        let identity = Identity::user("u4");
        tracker.record(&identity, true, 200).await;
        let first = store
            .hash_get_all(&keys::behavior(&identity))
            .await
            .unwrap()
            .get(F_FIRST_SEEN)
            .cloned();
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.record(&identity, true, 200).await;
        let second = store
            .hash_get_all(&keys::behavior(&identity))
            .await
            .unwrap()
            .get(F_FIRST_SEEN)
            .cloned();
        assert_eq!(first, second);
    }
}
