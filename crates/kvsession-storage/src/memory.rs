//! In-process session storage with per-entry expiry
//!
//! All data is lost when the process stops.

use crate::traits::{Capability, SessionData, Storage, StorageResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Default interval of the janitor that evicts expired entries
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    data: SessionData,
    expires_at: Instant,
}

/// Concurrent map of session id to data with an expiry per entry.
///
/// Expired entries are invisible to readers immediately and are evicted either
/// lazily on access or by `purge_expired`.
#[derive(Default)]
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SessionData> {
        let now = Instant::now();
        {
            let entry = self.entries.get(id)?;
            if entry.expires_at > now {
                return Some(entry.data.clone());
            }
        }
        self.entries.remove_if(id, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, id: &str, data: SessionData, ttl: Duration) {
        let entry = CacheEntry {
            data,
            expires_at: deadline(Instant::now(), ttl),
        };
        self.entries.insert(id.to_string(), entry);
    }

    /// Reset the expiry of a live entry. Returns false if it is absent or expired.
    pub fn touch(&self, id: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(id) {
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = deadline(now, ttl);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Evict every expired entry; returns how many were evicted
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expiry instant; TTLs past what `Instant` can represent are clamped
fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_REPRESENTABLE_TTL))
        .unwrap_or(now)
}

/// About a century, far beyond any session lifetime
const MAX_REPRESENTABLE_TTL: Duration = Duration::from_secs(100 * 365 * 86_400);

/// In-memory session store
pub struct MemoryStorage {
    cache: Arc<TtlCache>,
    janitor: Option<JoinHandle<()>>,
}

impl MemoryStorage {
    /// Create a memory store. Inside a Tokio runtime a janitor task evicts
    /// expired entries every `DEFAULT_CLEANUP_INTERVAL`.
    pub fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(every: Duration) -> Self {
        let cache = Arc::new(TtlCache::new());
        let janitor = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(janitor_loop(Arc::downgrade(&cache), every)));

        Self { cache, janitor }
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

async fn janitor_loop(cache: Weak<TtlCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        let evicted = cache.purge_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired in-memory sessions");
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn remove_all(&self, id: &str) -> StorageResult<Capability<()>> {
        self.cache.remove(id);
        Ok(Capability::Supported(()))
    }

    async fn get_session(
        &self,
        id: &str,
        _ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        Ok(Capability::Supported(self.cache.get(id)))
    }

    async fn set_session(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.cache.insert(id, data.clone(), ttl);
        Ok(Capability::Supported(()))
    }

    async fn update_ttl(&self, id: &str, ttl: Duration) -> StorageResult<Capability<()>> {
        self.cache.touch(id, ttl);
        Ok(Capability::Supported(()))
    }
}
