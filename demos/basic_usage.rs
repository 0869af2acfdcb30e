//! Basic Usage Example
//!
//! Demonstrates cache operations: set, get, get_or_load, invalidation,
//! and metrics.
//!
//! Run with: cargo run --example basic_usage

use adaptive_gate::{AdaptiveGate, CacheStrategy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Adaptive Gate: Basic Usage ===\n");

    // 1. Initialize the gate (connects to REDIS_URL, default localhost)
    let gate = AdaptiveGate::new().await?;
    gate.start();
    println!();

    // 2. Health check
    if gate.health_check().await {
        println!("✅ Gate is healthy\n");
    }

    // 3. Store data under different strategies
    let user_data = serde_json::json!({
        "id": 1,
        "name": "Alice",
        "email": "alice@example.com",
        "role": "admin"
    });

    println!("Storing user data with HOT strategy (5 min TTL, local tier)...");
    gate.cache()
        .set("user:1", user_data.clone(), CacheStrategy::Hot)
        .await;
    println!();

    // 4. Retrieve data (this read is a local-tier hit)
    println!("Retrieving user data...");
    if let Some(cached_user) = gate.cache().get("user:1").await {
        println!("✅ Retrieved from cache: {cached_user}");
    }
    println!();

    // 5. Compute-on-miss with stampede protection
    println!("Loading a report through get_or_load...");
    let report = gate
        .cache()
        .get_or_load("report:monthly", CacheStrategy::Warm, || async {
            // Stand-in for a database query or upstream API call
            Ok(serde_json::json!({ "month": "January", "total": 42 }))
        })
        .await?;
    println!("✅ Loaded: {report}");
    println!();

    // 6. Invalidate everything belonging to the user
    println!("Invalidating user:1:* ...");
    let removed = gate.cache().invalidate_pattern("user:*").await;
    println!("✅ Removed {removed} entries");
    println!();

    // 7. Cache statistics
    let metrics = gate.cache().metrics();
    println!("=== Cache Metrics ===");
    println!("Hits: {} (local {})", metrics.hits, metrics.local_hits);
    println!("Misses: {}", metrics.misses);
    println!("Hit rate: {:.1}%", metrics.hit_rate() * 100.0);
    println!("Local items: {}", metrics.local_items);

    gate.stop();
    Ok(())
}
