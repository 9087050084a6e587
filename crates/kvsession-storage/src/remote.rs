//! Boundary to a remote key-value/hash store
//!
//! The redis backends talk to the store through `RemoteClient`, which covers
//! exactly the commands they need. `RedisClient` implements it over a `redis`
//! connection manager; tests use `testing::FakeRemote`.

use crate::traits::StorageResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Commands a remote session backend needs
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// GET
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// SETEX
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> StorageResult<()>;

    /// EXPIRE. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> StorageResult<bool>;

    /// DEL
    async fn del(&self, key: &str) -> StorageResult<()>;

    /// EXISTS
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// HGET
    async fn hget(&self, key: &str, field: &str) -> StorageResult<Option<String>>;

    /// HSET with one or more fields
    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> StorageResult<()>;

    /// HDEL
    async fn hdel(&self, key: &str, fields: &[String]) -> StorageResult<()>;

    /// HGETALL
    async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>>;

    /// HLEN
    async fn hlen(&self, key: &str) -> StorageResult<usize>;
}

/// Default deadline of a single remote command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote stores expire in whole seconds; round up so a key never outlives
/// its TTL by less than asked, and never pass 0 (which deletes the key).
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.max(1)
}

#[cfg(feature = "redis")]
pub use self::redis_client::RedisClient;

#[cfg(feature = "redis")]
mod redis_client {
    use super::{DEFAULT_COMMAND_TIMEOUT, RemoteClient};
    use crate::traits::{StorageError, StorageResult};
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;
    use std::collections::HashMap;
    use std::future::Future;
    use std::time::Duration;

    /// `RemoteClient` over a multiplexed, auto-reconnecting redis connection
    #[derive(Clone)]
    pub struct RedisClient {
        conn: ConnectionManager,
        timeout: Duration,
    }

    impl RedisClient {
        /// Connect to `url`. Fails fast if the url is malformed or the server
        /// is unreachable.
        pub async fn connect(url: &str, timeout: Duration) -> StorageResult<Self> {
            let client = redis::Client::open(url).map_err(|e| {
                StorageError::Config(format!("Failed to create Redis client: {}", e))
            })?;

            let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| StorageError::Timeout(timeout))?
                .map_err(|e| StorageError::Config(format!("Failed to connect to Redis: {}", e)))?;

            tracing::debug!(url = %url, "Connected to Redis");
            Ok(Self { conn, timeout })
        }

        pub async fn connect_default(url: &str) -> StorageResult<Self> {
            Self::connect(url, DEFAULT_COMMAND_TIMEOUT).await
        }

        async fn run<T, F>(&self, command: &'static str, fut: F) -> StorageResult<T>
        where
            F: Future<Output = redis::RedisResult<T>>,
        {
            match tokio::time::timeout(self.timeout, fut).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(StorageError::Backend(format!(
                    "Redis {} failed: {}",
                    command, e
                ))),
                Err(_) => Err(StorageError::Timeout(self.timeout)),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for RedisClient {
        async fn get(&self, key: &str) -> StorageResult<Option<String>> {
            let mut conn = self.conn.clone();
            self.run("GET", async move { conn.get::<_, Option<String>>(key).await })
                .await
        }

        async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> StorageResult<()> {
            let mut conn = self.conn.clone();
            self.run("SETEX", async move {
                conn.set_ex::<_, _, ()>(key, value, ttl_secs).await
            })
            .await
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> StorageResult<bool> {
            let mut conn = self.conn.clone();
            let secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
            self.run("EXPIRE", async move { conn.expire::<_, bool>(key, secs).await })
                .await
        }

        async fn del(&self, key: &str) -> StorageResult<()> {
            let mut conn = self.conn.clone();
            self.run("DEL", async move { conn.del::<_, ()>(key).await })
                .await
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            let mut conn = self.conn.clone();
            self.run("EXISTS", async move { conn.exists::<_, bool>(key).await })
                .await
        }

        async fn hget(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
            let mut conn = self.conn.clone();
            self.run("HGET", async move {
                conn.hget::<_, _, Option<String>>(key, field).await
            })
            .await
        }

        async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> StorageResult<()> {
            if fields.is_empty() {
                return Ok(());
            }
            let mut conn = self.conn.clone();
            self.run("HSET", async move {
                conn.hset_multiple::<_, _, _, ()>(key, &fields).await
            })
            .await
        }

        async fn hdel(&self, key: &str, fields: &[String]) -> StorageResult<()> {
            if fields.is_empty() {
                return Ok(());
            }
            let mut conn = self.conn.clone();
            let fields = fields.to_vec();
            self.run("HDEL", async move { conn.hdel::<_, _, ()>(key, fields).await })
                .await
        }

        async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>> {
            let mut conn = self.conn.clone();
            self.run("HGETALL", async move {
                conn.hgetall::<_, HashMap<String, String>>(key).await
            })
            .await
        }

        async fn hlen(&self, key: &str) -> StorageResult<usize> {
            let mut conn = self.conn.clone();
            self.run("HLEN", async move { conn.hlen::<_, usize>(key).await })
                .await
        }
    }
}
