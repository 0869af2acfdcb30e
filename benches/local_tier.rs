//! Benchmarks for the in-process tier and limit evaluation
//!
//! This benchmark suite measures:
//! - Write cost per strategy and payload size
//! - Local-tier hit latency vs store-tier hit latency
//! - Eviction churn when the local tier is full
//! - One full rate-limit evaluation

use std::sync::Arc;
use std::time::Duration;

use adaptive_gate::{
    AdaptiveGate, CacheStrategy, Identity, MemoryStore, StrategyPolicy,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;

/// Setup a gate over the in-memory store for benchmarks
fn setup_gate() -> (AdaptiveGate, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let gate = rt.block_on(async {
        AdaptiveGate::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap_or_else(|_| panic!("Failed to build gate"))
    });
    (gate, rt)
}

/// Generate test data of specified size
fn test_data(size_bytes: usize) -> serde_json::Value {
    json!({
        "data": "x".repeat(size_bytes),
        "size": size_bytes,
    })
}

/// Benchmark writes per strategy and payload size
fn bench_set(c: &mut Criterion) {
    let (gate, rt) = setup_gate();

    let mut group = c.benchmark_group("cache_set");
    group.measurement_time(Duration::from_secs(10));

    for size in &[100, 1024, 10240] {
        let data = test_data(*size);

        // HOT never compresses; WARM compresses past its threshold.
        group.bench_with_input(BenchmarkId::new("hot", size), size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let key = format!("bench:set:{}", rand::random::<u32>());
                gate.cache()
                    .set(&key, black_box(data.clone()), CacheStrategy::Hot)
                    .await;
            });
        });

        group.bench_with_input(BenchmarkId::new("warm", size), size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let key = format!("bench:set:{}", rand::random::<u32>());
                gate.cache()
                    .set(&key, black_box(data.clone()), CacheStrategy::Warm)
                    .await;
            });
        });
    }

    group.finish();
}

/// Benchmark local-tier hit latency
fn bench_local_hit(c: &mut Criterion) {
    let (gate, rt) = setup_gate();

    rt.block_on(async {
        for i in 0..100 {
            let key = format!("bench:local:{i}");
            gate.cache()
                .set(&key, test_data(1024), CacheStrategy::Hot)
                .await;
        }
    });

    c.bench_function("local_tier_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("bench:local:{}", rand::random::<u8>() % 100);
            black_box(gate.cache().get(&key).await);
        });
    });
}

/// Benchmark store-tier hit latency (COLD entries never sit locally)
fn bench_store_hit(c: &mut Criterion) {
    let (gate, rt) = setup_gate();

    rt.block_on(async {
        for i in 0..100 {
            let key = format!("bench:store:{i}");
            gate.cache()
                .set(&key, test_data(1024), CacheStrategy::Cold)
                .await;
        }
    });

    c.bench_function("store_tier_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("bench:store:{}", rand::random::<u8>() % 100);
            black_box(gate.cache().get(&key).await);
        });
    });
}

/// Benchmark cache miss latency
fn bench_miss(c: &mut Criterion) {
    let (gate, rt) = setup_gate();

    c.bench_function("cache_miss", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("bench:miss:{}", rand::random::<u32>());
            black_box(gate.cache().get(&key).await);
        });
    });
}

/// Benchmark writes into a full local tier, where every insert evicts
fn bench_eviction_churn(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let gate = rt.block_on(async {
        AdaptiveGate::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .strategy_policy(
                CacheStrategy::Hot,
                StrategyPolicy {
                    max_local_items: 128,
                    ..StrategyPolicy::default_for(CacheStrategy::Hot)
                },
            )
            .build()
            .await
            .unwrap_or_else(|_| panic!("Failed to build gate"))
    });
    let data = test_data(256);

    rt.block_on(async {
        for i in 0..128 {
            gate.cache()
                .set(&format!("bench:churn:fill:{i}"), data.clone(), CacheStrategy::Hot)
                .await;
        }
    });

    c.bench_function("eviction_churn", |b| {
        b.to_async(&rt).iter(|| async {
            let key = format!("bench:churn:{}", rand::random::<u32>());
            gate.cache()
                .set(&key, black_box(data.clone()), CacheStrategy::Hot)
                .await;
        });
    });
}

/// Benchmark one full rate-limit evaluation
fn bench_limiter_evaluate(c: &mut Criterion) {
    let (gate, rt) = setup_gate();

    c.bench_function("limiter_evaluate", |b| {
        b.to_async(&rt).iter(|| async {
            let identity = Identity::anonymous(format!("10.0.{}.{}",
                rand::random::<u8>(),
                rand::random::<u8>()));
            black_box(gate.limiter().evaluate(&identity, "reports").await);
        });
    });
}

criterion_group!(
    benches,
    bench_set,
    bench_local_hit,
    bench_store_hit,
    bench_miss,
    bench_eviction_churn,
    bench_limiter_evaluate
);
criterion_main!(benches);
