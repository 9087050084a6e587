//! In-process test doubles
//!
//! `FakeRemote` stands in for a Redis server behind `RemoteClient`, with
//! per-command call counters and failure injection. `CountingStorage` wraps any
//! `Storage` and counts calls per method.

use crate::remote::RemoteClient;
use crate::traits::{Capability, SessionData, Storage, StorageError, StorageMode, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Stored {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct FakeEntry {
    value: Stored,
    ttl_secs: Option<u64>,
    expires_at: Option<Instant>,
}

impl FakeEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory remote store honouring key expiry
#[derive(Default)]
pub struct FakeRemote {
    entries: Mutex<HashMap<String, FakeEntry>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures_left: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `command` (e.g. "EXPIRE") was issued
    pub fn calls(&self, command: &str) -> usize {
        lock(&self.calls).get(command).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Make the next `n` commands fail with a backend error
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Raw string value of a live key
    pub fn get_raw(&self, key: &str) -> Option<String> {
        match self.live(key)?.value {
            Stored::Str(value) => Some(value),
            Stored::Hash(_) => None,
        }
    }

    /// Raw value of one field of a live hash
    pub fn hget_raw(&self, key: &str, field: &str) -> Option<String> {
        match self.live(key)?.value {
            Stored::Hash(mut fields) => fields.remove(field),
            Stored::Str(_) => None,
        }
    }

    /// TTL in seconds last applied to a live key
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.live(key)?.ttl_secs
    }

    /// Expire a key immediately, as if its TTL had elapsed
    pub fn expire_now(&self, key: &str) {
        if let Some(entry) = lock(&self.entries).get_mut(key) {
            entry.expires_at = Some(Instant::now());
        }
    }

    fn live(&self, key: &str) -> Option<FakeEntry> {
        let now = Instant::now();
        lock(&self.entries)
            .get(key)
            .filter(|entry| entry.is_live(now))
            .cloned()
    }

    fn record(&self, command: &'static str) -> StorageResult<()> {
        *lock(&self.calls).entry(command).or_insert(0) += 1;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend(format!(
                "Injected failure on {}",
                command
            )));
        }
        Ok(())
    }

    /// Entries with expired keys dropped, like a real server
    fn entries(&self) -> MutexGuard<'_, HashMap<String, FakeEntry>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, entry| entry.is_live(now));
        entries
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expiry(ttl_secs: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(ttl_secs))
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.record("GET")?;
        Ok(self.get_raw(key))
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> StorageResult<()> {
        self.record("SETEX")?;
        self.entries().insert(
            key.to_string(),
            FakeEntry {
                value: Stored::Str(value),
                ttl_secs: Some(ttl_secs),
                expires_at: Some(expiry(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StorageResult<bool> {
        self.record("EXPIRE")?;
        match self.entries().get_mut(key) {
            Some(entry) => {
                entry.ttl_secs = Some(ttl_secs);
                entry.expires_at = Some(expiry(ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        self.record("DEL")?;
        self.entries().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.record("EXISTS")?;
        Ok(self.entries().contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        self.record("HGET")?;
        Ok(self.hget_raw(key, field))
    }

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> StorageResult<()> {
        self.record("HSET")?;
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(|| FakeEntry {
            value: Stored::Hash(HashMap::new()),
            ttl_secs: None,
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Hash(hash) => {
                hash.extend(fields);
                Ok(())
            }
            Stored::Str(_) => Err(StorageError::Backend(
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
            )),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StorageResult<()> {
        self.record("HDEL")?;
        let mut entries = self.entries();
        let now_empty = match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Stored::Hash(hash)) => {
                for field in fields {
                    hash.remove(field);
                }
                hash.is_empty()
            }
            _ => false,
        };
        // Redis deletes a hash whose last field is removed
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        self.record("HGETALL")?;
        match self.live(key).map(|entry| entry.value) {
            Some(Stored::Hash(hash)) => Ok(hash),
            _ => Ok(HashMap::new()),
        }
    }

    async fn hlen(&self, key: &str) -> StorageResult<usize> {
        self.record("HLEN")?;
        match self.live(key).map(|entry| entry.value) {
            Some(Stored::Hash(hash)) => Ok(hash.len()),
            _ => Ok(0),
        }
    }
}

/// `Storage` wrapper counting calls per method name
pub struct CountingStorage {
    inner: Arc<dyn Storage>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Number of calls to `method` (e.g. "set_session")
    pub fn calls(&self, method: &str) -> usize {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, method: &'static str) {
        *lock(&self.calls).entry(method).or_insert(0) += 1;
    }
}

#[async_trait]
impl Storage for CountingStorage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn mode(&self) -> StorageMode {
        self.inner.mode()
    }

    async fn new_id(&self, ttl: Duration) -> StorageResult<Capability<String>> {
        self.record("new_id");
        self.inner.new_id(ttl).await
    }

    async fn get(&self, id: &str, key: &str) -> StorageResult<Capability<Option<Value>>> {
        self.record("get");
        self.inner.get(id, key).await
    }

    async fn get_size(&self, id: &str) -> StorageResult<Capability<usize>> {
        self.record("get_size");
        self.inner.get_size(id).await
    }

    async fn data(&self, id: &str) -> StorageResult<Capability<SessionData>> {
        self.record("data");
        self.inner.data(id).await
    }

    async fn set(
        &self,
        id: &str,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.record("set");
        self.inner.set(id, key, value, ttl).await
    }

    async fn set_map(
        &self,
        id: &str,
        data: SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.record("set_map");
        self.inner.set_map(id, data, ttl).await
    }

    async fn remove(&self, id: &str, key: &str) -> StorageResult<Capability<()>> {
        self.record("remove");
        self.inner.remove(id, key).await
    }

    async fn remove_all(&self, id: &str) -> StorageResult<Capability<()>> {
        self.record("remove_all");
        self.inner.remove_all(id).await
    }

    async fn get_session(
        &self,
        id: &str,
        ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        self.record("get_session");
        self.inner.get_session(id, ttl).await
    }

    async fn set_session(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.record("set_session");
        self.inner.set_session(id, data, ttl).await
    }

    async fn update_ttl(&self, id: &str, ttl: Duration) -> StorageResult<Capability<()>> {
        self.record("update_ttl");
        self.inner.update_ttl(id, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    #[tokio::test]
    async fn test_fake_remote_expires_keys() {
        let remote = FakeRemote::new();
        remote.set_ex("k", "v".to_string(), 60).await.unwrap();
        assert_eq!(remote.get("k").await.unwrap(), Some("v".to_string()));

        remote.expire_now("k");
        assert_eq!(remote.get("k").await.unwrap(), None);
        assert!(!remote.expire("k", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_fake_remote_counts_and_injects_failures() {
        let remote = FakeRemote::new();
        remote.fail_next(1);

        assert!(remote.exists("k").await.is_err());
        assert!(!remote.exists("k").await.unwrap());
        assert_eq!(remote.calls("EXISTS"), 2);
    }

    #[tokio::test]
    async fn test_removing_last_hash_field_deletes_key() {
        let remote = FakeRemote::new();
        remote
            .hset("h", vec![("a".to_string(), "1".to_string())])
            .await
            .unwrap();
        remote.hdel("h", &["a".to_string()]).await.unwrap();

        assert!(!remote.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_counting_storage_delegates() {
        let storage = CountingStorage::new(Arc::new(MemoryStorage::new()));
        let ttl = Duration::from_secs(60);

        storage
            .set_session("sess_1", &SessionData::new(), ttl)
            .await
            .unwrap();
        let loaded = storage.get_session("sess_1", ttl).await.unwrap();

        assert_eq!(loaded, Capability::Supported(Some(SessionData::new())));
        assert_eq!(storage.calls("set_session"), 1);
        assert_eq!(storage.calls("get_session"), 1);
        assert_eq!(storage.name(), "memory");
    }
}
