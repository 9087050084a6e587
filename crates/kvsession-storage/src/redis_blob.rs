//! Redis blob session storage
//!
//! The whole session map is JSON-encoded under one key, `<prefix><id>`, written
//! with SETEX. TTL refreshes are EXPIRE calls batched through a `TtlBatcher`.

use crate::batch::{BatchConfig, TtlBatcher, TtlSink};
use crate::remote::{RemoteClient, ttl_seconds};
use crate::traits::{Capability, SessionData, Storage, StorageResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RedisStorageOptions {
    /// Prepended to every session id to form the key
    pub prefix: String,
    pub batch: BatchConfig,
}

/// Redis blob session store
pub struct RedisStorage {
    inner: Arc<RedisBlobInner>,
    batcher: TtlBatcher,
}

struct RedisBlobInner {
    client: Arc<dyn RemoteClient>,
    prefix: String,
}

impl RedisBlobInner {
    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    async fn expire(&self, session_id: &str, ttl: Duration) -> StorageResult<()> {
        let existed = self
            .client
            .expire(&self.key(session_id), ttl_seconds(ttl))
            .await?;
        if !existed {
            tracing::debug!(session_id = %session_id, "TTL refresh for a session no longer in Redis");
        }
        Ok(())
    }
}

#[async_trait]
impl TtlSink for RedisBlobInner {
    async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> StorageResult<()> {
        self.expire(session_id, ttl).await
    }
}

impl RedisStorage {
    /// Must be called from within a Tokio runtime.
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self::with_options(client, RedisStorageOptions::default())
    }

    pub fn with_options(client: Arc<dyn RemoteClient>, options: RedisStorageOptions) -> Self {
        let inner = Arc::new(RedisBlobInner {
            client,
            prefix: options.prefix,
        });
        let batcher = TtlBatcher::spawn(Arc::clone(&inner), options.batch);

        Self { inner, batcher }
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Send all batched EXPIRE calls now; returns how many were sent
    pub async fn flush_ttl(&self) -> usize {
        self.batcher.flush().await
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn remove_all(&self, id: &str) -> StorageResult<Capability<()>> {
        self.inner.client.del(&self.inner.key(id)).await?;
        Ok(Capability::Supported(()))
    }

    async fn get_session(
        &self,
        id: &str,
        _ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        let raw = self.inner.client.get(&self.inner.key(id)).await?;
        let data = match raw {
            Some(json) if !json.is_empty() => Some(serde_json::from_str(&json)?),
            _ => None,
        };
        Ok(Capability::Supported(data))
    }

    async fn set_session(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        let json = serde_json::to_string(data)?;
        self.inner
            .client
            .set_ex(&self.inner.key(id), json, ttl_seconds(ttl))
            .await?;
        Ok(Capability::Supported(()))
    }

    async fn update_ttl(&self, id: &str, ttl: Duration) -> StorageResult<Capability<()>> {
        // A TTL shorter than the batch interval could lapse before the drain
        if ttl < self.batcher.interval() || !self.batcher.touch(id, ttl) {
            self.inner.expire(id, ttl).await?;
        }
        Ok(Capability::Supported(()))
    }
}
