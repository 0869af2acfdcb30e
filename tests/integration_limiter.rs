//! Integration tests for the rate limiter
//!
//! Covers window enforcement and sliding expiry, endpoint isolation and
//! multipliers, behavior-driven penalties, automatic blocking and block
//! expiry, suspicion marking, categorization from seeded history, and
//! administrative reset.

mod common;

use std::time::Duration;

use adaptive_gate::{
    AdaptiveGate, Category, CategoryLimit, DistributedStore, Identity, MemoryStore,
};
use common::*;
use std::sync::Arc;
use tokio::time::sleep;

const MS_PER_DAY: u64 = 86_400_000;

async fn gate_with_new_limit(store: Arc<MemoryStore>, max: u32, window: Duration) -> AdaptiveGate {
    AdaptiveGate::builder()
        .with_store(store)
        .category_limit(
            Category::New,
            CategoryLimit {
                max_requests: max,
                window,
                block_duration: Duration::from_secs(600),
            },
        )
        .build()
        .await
        .unwrap()
}

/// Test that requests are allowed up to the cap and denied past it
#[tokio::test]
async fn test_limit_allows_up_to_the_cap_then_denies() {
    let gate = gate_with_new_limit(memory_store(), 3, Duration::from_secs(60)).await;
    let identity = Identity::anonymous("10.1.1.1");

    for used in 1..=3u32 {
        let decision = gate.limiter().evaluate(&identity, "reports").await;
        assert!(decision.allowed, "request {used} should pass");
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 3 - used);
        assert_eq!(decision.category, Category::New);
    }

    let denied = gate.limiter().evaluate(&identity, "reports").await;
    assert!(!denied.allowed);
    assert!(!denied.blocked);
    assert_eq!(denied.remaining, 0);
    assert!(denied.retry_after_secs() >= 1);

    let metrics = gate.limiter().metrics();
    assert_eq!(metrics.allowed, 3);
    assert_eq!(metrics.limited, 1);
}

/// Test that the sliding window frees slots as old requests age out
#[tokio::test]
async fn test_sliding_window_frees_slots_as_requests_age_out() {
    let gate = gate_with_new_limit(memory_store(), 2, Duration::from_millis(300)).await;
    let identity = Identity::anonymous("10.1.1.2");

    assert!(gate.limiter().evaluate(&identity, "reports").await.allowed);
    assert!(gate.limiter().evaluate(&identity, "reports").await.allowed);
    assert!(!gate.limiter().evaluate(&identity, "reports").await.allowed);

    sleep(Duration::from_millis(400)).await;
    assert!(gate.limiter().evaluate(&identity, "reports").await.allowed);
}

/// Test that each endpoint gets its own window
#[tokio::test]
async fn test_endpoints_are_limited_independently() {
    let gate = gate_with_new_limit(memory_store(), 2, Duration::from_secs(60)).await;
    let identity = Identity::anonymous("10.1.1.3");

    gate.limiter().evaluate(&identity, "alpha").await;
    gate.limiter().evaluate(&identity, "alpha").await;
    assert!(!gate.limiter().evaluate(&identity, "alpha").await.allowed);

    // A different endpoint still has its full budget.
    assert!(gate.limiter().evaluate(&identity, "beta").await.allowed);
}

/// Test that endpoint multipliers scale the effective limit
#[tokio::test]
async fn test_endpoint_multiplier_scales_the_limit() {
    let gate = AdaptiveGate::builder()
        .with_store(memory_store())
        .category_limit(
            Category::New,
            CategoryLimit {
                max_requests: 4,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(600),
            },
        )
        .endpoint_multiplier("exports", 0.5)
        .build()
        .await
        .unwrap();
    let identity = Identity::anonymous("10.1.1.4");

    let first = gate.limiter().evaluate(&identity, "exports").await;
    assert!(first.allowed);
    assert_eq!(first.limit, 2);

    gate.limiter().evaluate(&identity, "exports").await;
    assert!(!gate.limiter().evaluate(&identity, "exports").await.allowed);

    // The unweighted endpoint still gets the full four.
    let plain = gate.limiter().evaluate(&identity, "reports").await;
    assert_eq!(plain.limit, 4);
}

/// Test that a burst of failed logins blocks the identity outright
#[tokio::test]
async fn test_failed_auth_burst_blocks() {
    let gate = default_gate().await;
    let identity = Identity::user("bruteforcer");

    for _ in 0..11 {
        gate.limiter().record_outcome(&identity, false, 401).await;
    }

    let decision = gate.limiter().evaluate(&identity, "auth").await;
    assert!(!decision.allowed);
    assert!(decision.blocked);
    assert_eq!(decision.category, Category::Blocked);
    assert_eq!(decision.limit, 0);
    assert!(decision.retry_after_secs() >= 1);

    // The block is a store record now; the next evaluation hits it directly.
    let repeat = gate.limiter().evaluate(&identity, "auth").await;
    assert!(repeat.blocked);

    let metrics = gate.limiter().metrics();
    assert_eq!(metrics.blocks_issued, 1);
    assert_eq!(metrics.blocked_hits, 1);
}

/// Test that a block expires on its own once behavior cools down
#[tokio::test]
async fn test_block_expires_on_its_own() {
    let store = memory_store();
    let gate = AdaptiveGate::builder()
        .with_store(store.clone())
        .category_limit(
            Category::New,
            CategoryLimit {
                max_requests: 30,
                window: Duration::from_secs(60),
                block_duration: Duration::from_millis(250),
            },
        )
        .build()
        .await
        .unwrap();
    let identity = Identity::user("hasty");

    // A rapid-fire spike past fifty requests trips the automatic block. The
    // counter's own TTL is shorter than the block, so by the time the block
    // lapses the behavior has cooled down.
    store
        .set_bytes(
            &format!("ratelimit:rapid:{}", identity.as_str()),
            b"60",
            Duration::from_millis(150),
        )
        .await
        .unwrap();

    let blocked = gate.limiter().evaluate(&identity, "reports").await;
    assert!(blocked.blocked);

    sleep(Duration::from_millis(400)).await;
    let after = gate.limiter().evaluate(&identity, "reports").await;
    assert!(after.allowed, "block should have expired");
    assert!(!after.blocked);
}

/// Test that exceeding the limit marks the identity suspicious
#[tokio::test]
async fn test_over_limit_marks_identity_suspicious() {
    let gate = gate_with_new_limit(memory_store(), 2, Duration::from_secs(60)).await;
    let identity = Identity::anonymous("10.1.1.5");

    gate.limiter().evaluate(&identity, "reports").await;
    gate.limiter().evaluate(&identity, "reports").await;
    let denied = gate.limiter().evaluate(&identity, "reports").await;
    assert!(!denied.allowed);
    assert_eq!(denied.category, Category::New);

    // The violation downgraded the identity for subsequent evaluations.
    let next = gate.limiter().evaluate(&identity, "reports").await;
    assert_eq!(next.category, Category::Suspicious);

    let status = gate.limiter().status(&identity).await;
    assert_eq!(status.category, Category::Suspicious);
}

/// Test that a long good history earns the power-user budget
#[tokio::test]
async fn test_power_users_get_a_bigger_budget() {
    let store = memory_store();
    let gate = gate_on(store.clone()).await;
    let identity = Identity::user("veteran");
    let behavior_key = format!("ratelimit:behavior:{}", identity.as_str());

    let seeded = [
        ("successful_requests", "5000".to_string()),
        ("total_requests", "5100".to_string()),
        ("error_requests", "100".to_string()),
        ("error_rate", "0.019608".to_string()),
        (
            "first_seen_ms",
            (epoch_ms() - 40 * MS_PER_DAY).to_string(),
        ),
    ];
    for (field, value) in &seeded {
        store.hash_set(&behavior_key, field, value).await.unwrap();
    }

    let status = gate.limiter().status(&identity).await;
    assert_eq!(status.category, Category::Power);
    assert_eq!(status.quota.max_requests, 180);
    assert_eq!(status.behavior.successful_requests, 5000);
    assert_eq!(status.behavior.account_age_days, 40);

    let decision = gate.limiter().evaluate(&identity, "reports").await;
    assert!(decision.allowed);
    assert_eq!(decision.category, Category::Power);
    assert_eq!(decision.limit, 180);
}

/// Test that accounts start in NEW and settle into NORMAL
#[tokio::test]
async fn test_new_accounts_settle_into_normal() {
    let store = memory_store();
    let gate = gate_on(store.clone()).await;

    let fresh = Identity::user("day-one");
    let status = gate.limiter().status(&fresh).await;
    assert_eq!(status.category, Category::New);
    assert_eq!(status.quota.max_requests, 30);

    let settled = Identity::user("week-two");
    store
        .hash_set(
            &format!("ratelimit:behavior:{}", settled.as_str()),
            "first_seen_ms",
            &(epoch_ms() - 9 * MS_PER_DAY).to_string(),
        )
        .await
        .unwrap();
    let status = gate.limiter().status(&settled).await;
    assert_eq!(status.category, Category::Normal);
    assert_eq!(status.quota.max_requests, 60);
}

/// Test that recorded errors tighten the effective limit
#[tokio::test]
async fn test_error_history_tightens_the_limit() {
    let gate = default_gate().await;
    let identity = Identity::user("flaky-client");

    for _ in 0..4 {
        gate.limiter().record_outcome(&identity, false, 500).await;
    }
    gate.limiter().record_outcome(&identity, true, 200).await;
    gate.limiter().record_outcome(&identity, true, 200).await;

    // error rate 4/6 halves the NEW budget of 30.
    let decision = gate.limiter().evaluate(&identity, "reports").await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, 15);
}

/// Test that status does not consume any of the window
#[tokio::test]
async fn test_status_reports_without_counting() {
    let gate = gate_with_new_limit(memory_store(), 2, Duration::from_secs(60)).await;
    let identity = Identity::anonymous("10.1.1.6");

    for _ in 0..5 {
        let status = gate.limiter().status(&identity).await;
        assert!(!status.blocked);
    }

    assert!(gate.limiter().evaluate(&identity, "reports").await.allowed);
    assert!(gate.limiter().evaluate(&identity, "reports").await.allowed);
}

/// Test that resetting an identity clears blocks, history, and windows
#[tokio::test]
async fn test_reset_identity_forgives_everything() {
    let gate = default_gate().await;
    let identity = Identity::user("forgiven");

    for _ in 0..11 {
        gate.limiter().record_outcome(&identity, false, 401).await;
    }
    assert!(gate.limiter().evaluate(&identity, "auth").await.blocked);

    assert!(gate.limiter().reset_identity(&identity).await);

    let status = gate.limiter().status(&identity).await;
    assert!(!status.blocked);
    assert_eq!(status.behavior.failed_auth_attempts, 0);
    assert_eq!(status.behavior.total_requests, 0);

    let decision = gate.limiter().evaluate(&identity, "auth").await;
    assert!(decision.allowed);
}
