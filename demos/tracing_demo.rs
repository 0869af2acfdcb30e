//! Tracing Example
//!
//! Shows the gate's structured logging under a fmt subscriber. Every
//! degradation and policy decision is visible at DEBUG.
//!
//! Run with: cargo run --example tracing_demo

use adaptive_gate::{AdaptiveGate, CacheStrategy, Identity};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .init();

    tracing::info!("starting tracing verification");

    let gate = AdaptiveGate::new().await?;
    gate.start();

    // A cache write and read, then one limiter evaluation
    gate.cache()
        .set("demo:key", serde_json::json!("value"), CacheStrategy::Hot)
        .await;
    let _ = gate.cache().get("demo:key").await;

    let decision = gate
        .limiter()
        .evaluate(&Identity::anonymous("203.0.113.9"), "demo")
        .await;
    tracing::info!(allowed = decision.allowed, "evaluation complete");

    gate.stop();
    Ok(())
}
