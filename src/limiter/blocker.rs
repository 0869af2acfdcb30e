//! Block records and suspicion markers.
//!
//! Blocks live in the shared store under their own key with a TTL, so they
//! apply across instances and expire on their own. Lookups fail open: an
//! unreachable store never locks everyone out, it just means blocks are not
//! visible until the store returns.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{keys, Identity};
use crate::store::{now_ms, DistributedStore, TtlState};

/// Retry horizon reported for a block pinned without an expiry.
const PINNED_BLOCK_RETRY: Duration = Duration::from_secs(86_400);

pub(crate) struct Blocker {
    store: Arc<dyn DistributedStore>,
    suspicious_ttl: Duration,
}

impl Blocker {
    pub fn new(store: Arc<dyn DistributedStore>, suspicious_ttl: Duration) -> Self {
        Self {
            store,
            suspicious_ttl,
        }
    }

    /// Record a block that every instance will observe until it expires.
    pub async fn block(&self, identity: &Identity, duration: Duration) {
        let key = keys::blocked(identity);
        let stamp = now_ms().to_string();
        match self.store.set_bytes(&key, stamp.as_bytes(), duration).await {
            Ok(()) => info!(
                identity = %identity,
                duration_secs = duration.as_secs(),
                "identity blocked"
            ),
            Err(err) => warn!(
                identity = %identity,
                error = %err,
                "block record write failed"
            ),
        }
    }

    /// Time left on an active block, or `None` when the identity is not
    /// blocked (including when the store cannot be reached).
    pub async fn remaining(&self, identity: &Identity) -> Option<Duration> {
        match self.store.ttl_state(&keys::blocked(identity)).await {
            Ok(TtlState::Remaining(left)) => Some(left),
            Ok(TtlState::NoExpiry) => Some(PINNED_BLOCK_RETRY),
            Ok(TtlState::Missing) => None,
            Err(err) => {
                warn!(
                    identity = %identity,
                    error = %err,
                    "block lookup failed, treating identity as unblocked"
                );
                None
            }
        }
    }

    /// Flag an identity so it lands in the suspicious category on its next
    /// evaluation. The marker carries its own TTL and clears itself.
    pub async fn mark_suspicious(&self, identity: &Identity) {
        let key = keys::suspicious(identity);
        if let Err(err) = self.store.set_bytes(&key, b"1", self.suspicious_ttl).await {
            warn!(
                identity = %identity,
                error = %err,
                "suspicion marker write failed"
            );
        }
    }

    pub async fn is_suspicious(&self, identity: &Identity) -> bool {
        self.store
            .exists(&keys::suspicious(identity))
            .await
            .unwrap_or(false)
    }

    /// Administrative reset: drop the block, the suspicion marker, the
    /// behavior profile and every request window for this identity. Returns
    /// false when any part of the cleanup failed and may need a retry.
    pub async fn reset(&self, identity: &Identity) -> bool {
        let mut complete = true;

        let direct = [
            keys::blocked(identity),
            keys::suspicious(identity),
            keys::behavior(identity),
            keys::rapid(identity),
        ];
        if let Err(err) = self.store.delete_many(&direct).await {
            warn!(identity = %identity, error = %err, "reset of identity records failed");
            complete = false;
        }

        let pattern = format!("{}*", keys::requests_prefix(identity));
        match self.store.scan_keys(&pattern).await {
            Ok(windows) if windows.is_empty() => {}
            Ok(windows) => {
                if let Err(err) = self.store.delete_many(&windows).await {
                    warn!(identity = %identity, error = %err, "reset of request windows failed");
                    complete = false;
                }
            }
            Err(err) => {
                warn!(identity = %identity, error = %err, "request window scan failed during reset");
                complete = false;
            }
        }

        info!(identity = %identity, complete, "rate-limit state reset");
        complete
    }
}
