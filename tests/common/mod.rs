//! Common utilities for integration tests
//!
//! Every suite runs the full gate against the in-memory store, so the
//! helpers here hand out stores, gates wired to them, and test data. Tests
//! that need outage behavior flip the store offline through the shared
//! handle.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use adaptive_gate::{AdaptiveGate, MemoryStore};

/// Create a test key that will not collide with other tests
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Milliseconds since the epoch, for seeding store records by hand
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Fresh in-memory store, shareable between gates and with the test
pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Gate with stock policies on the given store
pub async fn gate_on(store: Arc<MemoryStore>) -> AdaptiveGate {
    AdaptiveGate::builder()
        .with_store(store)
        .build()
        .await
        .unwrap()
}

/// Gate with stock policies on its own private store
pub async fn default_gate() -> AdaptiveGate {
    gate_on(memory_store()).await
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Report {
        pub id: u64,
        pub title: String,
        pub totals: Vec<u64>,
    }

    impl Report {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                title: format!("Report {id}"),
                totals: (0..8).map(|n| n * id).collect(),
            }
        }
    }

    /// Generate JSON test data
    pub fn json_user(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("user{id}@example.com"),
        })
    }

    /// Generate compressible JSON test data of roughly the given size
    pub fn json_data_sized(size_kb: usize) -> serde_json::Value {
        let data_string = "x".repeat(size_kb * 1024);
        serde_json::json!({
            "data": data_string,
            "size_kb": size_kb,
        })
    }
}
