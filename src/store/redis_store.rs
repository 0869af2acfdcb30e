//! Redis-backed distributed store.
//!
//! Uses `ConnectionManager` for automatic reconnection and multiplexed
//! connections. Sliding-window and counter updates run as atomic MULTI/EXEC
//! pipelines so concurrent instances never observe a half-applied batch.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::{DistributedStore, TtlState, WindowSlide};
use crate::error::StoreError;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

/// Shared-store client backed by Redis.
///
/// Cloning is cheap: the connection manager multiplexes one underlying
/// connection and reconnects on its own when the link drops.
#[derive(Clone)]
pub struct RedisStore {
    // Kept alongside the manager because pub/sub needs its own connection.
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect using `REDIS_URL` from the environment, falling back to
    /// `redis://127.0.0.1:6379`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the URL is invalid or the server does not
    /// answer a ping.
    pub async fn connect() -> Result<Self, StoreError> {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&url).await
    }

    /// Connect to a specific Redis URL and verify the link with a ping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the URL is invalid or the server does not
    /// answer.
    pub async fn with_url(url: &str) -> Result<Self, StoreError> {
        info!(redis_url = %url, "connecting to distributed store");
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let store = Self { client, conn };
        store.ping().await?;
        info!("distributed store connection established");
        Ok(store)
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let _: () = conn.pset_ex(key, value, ttl_ms).await?;
        debug!(key = %key, ttl_ms, "stored value");
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(keys).await?;
        debug!(requested = keys.len(), removed, "bulk delete");
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        debug!(pattern = %pattern, count = keys.len(), "scanned keys");
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn ttl_state(&self, key: &str) -> Result<TtlState, StoreError> {
        let mut conn = self.conn.clone();
        let ms: i64 = conn.pttl(key).await?;
        Ok(match ms {
            -2 => TtlState::Missing,
            -1 => TtlState::NoExpiry,
            ms => TtlState::Remaining(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn incr_expire(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg((ttl.as_millis() as u64).max(1))
            .ignore();
        let (count,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn hash_incr_many(
        &self,
        key: &str,
        deltas: &[(&str, i64)],
    ) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, delta) in deltas {
            pipe.cmd("HINCRBY").arg(key).arg(*field).arg(*delta);
        }
        let values: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let written: bool = conn.hset_nx(key, field, value).await?;
        Ok(written)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn window_slide(
        &self,
        key: &str,
        window_start_ms: u64,
        now_ms: u64,
        member: &str,
        ttl: Duration,
    ) -> Result<WindowSlide, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0i64)
            .arg(window_start_ms as i64)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms as i64)
            .arg(member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0i64)
            .arg(0i64)
            .arg("WITHSCORES")
            .cmd("PEXPIRE")
            .arg(key)
            .arg((ttl.as_millis() as u64).max(1))
            .ignore();
        let (count, oldest): (u64, Vec<(String, f64)>) = pipe.query_async(&mut conn).await?;
        let oldest_ms = oldest.first().map(|(_, score)| *score as u64);
        Ok(WindowSlide { count, oldest_ms })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, receivers, "published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel = %channel, "subscribed to store channel");
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() })
            .boxed();
        Ok(stream)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
