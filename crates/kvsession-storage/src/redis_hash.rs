//! Redis hash session storage
//!
//! Each session is a hash at `<prefix><id>` with one field per session key,
//! the value JSON-encoded. Field operations go straight to Redis; nothing is
//! mirrored locally, so `get_session` only reports whether the hash exists.

use crate::remote::{RemoteClient, ttl_seconds};
use crate::traits::{Capability, SessionData, Storage, StorageMode, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct RedisHashStorage {
    client: Arc<dyn RemoteClient>,
    prefix: String,
}

impl RedisHashStorage {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self::with_prefix(client, "")
    }

    pub fn with_prefix(client: Arc<dyn RemoteClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    async fn expire(&self, id: &str, ttl: Duration) -> StorageResult<()> {
        self.client.expire(&self.key(id), ttl_seconds(ttl)).await?;
        Ok(())
    }
}

/// Field values written by other clients may not be JSON; keep them as strings.
fn decode_field(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn encode_field(value: &Value) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl Storage for RedisHashStorage {
    fn name(&self) -> &'static str {
        "redis_hash"
    }

    fn mode(&self) -> StorageMode {
        StorageMode::Direct
    }

    async fn get(&self, id: &str, key: &str) -> StorageResult<Capability<Option<Value>>> {
        let raw = self.client.hget(&self.key(id), key).await?;
        Ok(Capability::Supported(raw.map(decode_field)))
    }

    async fn get_size(&self, id: &str) -> StorageResult<Capability<usize>> {
        Ok(Capability::Supported(self.client.hlen(&self.key(id)).await?))
    }

    async fn data(&self, id: &str) -> StorageResult<Capability<SessionData>> {
        let fields = self.client.hgetall(&self.key(id)).await?;
        let data = fields
            .into_iter()
            .map(|(field, raw)| (field, decode_field(raw)))
            .collect();
        Ok(Capability::Supported(data))
    }

    async fn set(
        &self,
        id: &str,
        key: &str,
        value: Value,
        _ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        let field = (key.to_string(), encode_field(&value)?);
        self.client.hset(&self.key(id), vec![field]).await?;
        Ok(Capability::Supported(()))
    }

    async fn set_map(
        &self,
        id: &str,
        data: SessionData,
        _ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        let fields = data
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode_field(value)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        self.client.hset(&self.key(id), fields).await?;
        Ok(Capability::Supported(()))
    }

    async fn remove(&self, id: &str, key: &str) -> StorageResult<Capability<()>> {
        self.client
            .hdel(&self.key(id), &[key.to_string()])
            .await?;
        Ok(Capability::Supported(()))
    }

    async fn remove_all(&self, id: &str) -> StorageResult<Capability<()>> {
        self.client.del(&self.key(id)).await?;
        Ok(Capability::Supported(()))
    }

    /// `Some(empty)` if the hash exists, `None` otherwise. Fields are always
    /// read through `get`/`data`.
    async fn get_session(
        &self,
        id: &str,
        _ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        let exists = self.client.exists(&self.key(id)).await?;
        Ok(Capability::Supported(exists.then(SessionData::new)))
    }

    /// Fields already landed on each write; only the expiry needs resetting.
    async fn set_session(
        &self,
        id: &str,
        _data: &SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.expire(id, ttl).await?;
        Ok(Capability::Supported(()))
    }

    async fn update_ttl(&self, id: &str, ttl: Duration) -> StorageResult<Capability<()>> {
        self.expire(id, ttl).await?;
        Ok(Capability::Supported(()))
    }
}
