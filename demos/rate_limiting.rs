//! Rate Limiting Example
//!
//! Demonstrates sliding-window limits, behavior tracking, and what a
//! denied caller sees.
//!
//! Run with: cargo run --example rate_limiting

use adaptive_gate::{AdaptiveGate, Identity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Adaptive Gate: Rate Limiting ===\n");

    let gate = AdaptiveGate::new().await?;
    gate.start();

    // A brand-new identity starts in the NEW category (30 requests/min)
    let identity = Identity::user("demo-user");

    // 1. Burn through the window
    println!("Sending requests until the window fills...");
    let mut denied_after = 0u32;
    for attempt in 1..=40 {
        let decision = gate.limiter().evaluate(&identity, "api/reports").await;
        if decision.allowed {
            gate.limiter().record_outcome(&identity, true, 200).await;
        } else {
            denied_after = attempt;
            println!(
                "❌ Request {attempt} denied: category {}, limit {}, retry after {}s",
                decision.category,
                decision.limit,
                decision.retry_after_secs()
            );
            break;
        }
    }
    if denied_after == 0 {
        println!("All requests allowed (identity has history from a previous run)");
    }
    println!();

    // 2. Endpoints are limited independently
    let other = gate.limiter().evaluate(&identity, "api/search").await;
    println!(
        "Same identity on api/search: allowed={}, {} of {} remaining",
        other.allowed, other.remaining, other.limit
    );
    println!();

    // 3. Inspect the identity without spending a request
    let status = gate.limiter().status(&identity).await;
    println!("=== Identity Status ===");
    println!("Category: {}", status.category);
    println!("Blocked: {}", status.blocked);
    println!(
        "Requests: {} total, {:.1}% errors",
        status.behavior.total_requests,
        status.behavior.error_rate * 100.0
    );
    println!("Baseline quota: {}/window", status.quota.max_requests);
    println!();

    // 4. Limiter counters
    let metrics = gate.limiter().metrics();
    println!("=== Limiter Metrics ===");
    println!("Evaluations: {}", metrics.evaluations);
    println!("Allowed: {}, limited: {}", metrics.allowed, metrics.limited);
    println!("Degraded checks: {}", metrics.degraded_checks);

    gate.stop();
    Ok(())
}
