//! Session manager

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::session::Session;
use kvsession_storage::{FileStorage, Storage};
use std::sync::Arc;
use std::time::Duration;

/// Holds one storage backend and the default TTL, and hands out `Session`s.
///
/// Cloning is cheap; clones share the backend.
#[derive(Clone)]
pub struct Manager {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl Manager {
    /// Manager over a file backend rooted at `<temp>/kvsessions`.
    ///
    /// The directory is created if missing. Must be called from within a
    /// Tokio runtime.
    pub fn new(ttl: Duration) -> SessionResult<Self> {
        let dir = FileStorage::default_dir();
        std::fs::create_dir_all(&dir).map_err(kvsession_storage::StorageError::from)?;
        let storage = FileStorage::new(dir)?;
        Ok(Self::with_storage(ttl, Arc::new(storage)))
    }

    pub fn with_storage(ttl: Duration, storage: Arc<dyn Storage>) -> Self {
        Self { storage, ttl }
    }

    /// Build the configured backend. Configuration errors surface here.
    pub async fn from_config(config: &SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let storage = config.storage.build(config.ttl()).await?;
        tracing::info!(
            backend = storage.name(),
            ttl_secs = config.ttl_secs,
            "Session manager ready"
        );
        Ok(Self::with_storage(config.ttl(), storage))
    }

    /// A session whose id is assigned on first access. No I/O happens here.
    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.storage), self.ttl, None)
    }

    /// A session bound to an existing id. No I/O happens here.
    pub fn session(&self, id: impl Into<String>) -> Session {
        Session::new(Arc::clone(&self.storage), self.ttl, Some(id.into()))
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Replace the backend. Sessions already handed out keep the old one.
    pub fn set_storage(&mut self, storage: Arc<dyn Storage>) {
        self.storage = storage;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Change the TTL. Sessions already handed out keep the old one.
    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("storage", &self.storage.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsession_storage::{MemoryConfig, MemoryStorage, StorageConfig};

    #[tokio::test]
    async fn test_default_manager_uses_file_storage() {
        let manager = Manager::new(Duration::from_secs(60)).unwrap();
        assert_eq!(manager.storage().name(), "file");
        assert_eq!(manager.ttl(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_setters() {
        let mut manager =
            Manager::with_storage(Duration::from_secs(60), Arc::new(MemoryStorage::new()));
        manager.set_ttl(Duration::from_secs(5));
        assert_eq!(manager.ttl(), Duration::from_secs(5));

        let temp_dir = tempfile::TempDir::new().unwrap();
        manager.set_storage(Arc::new(FileStorage::new(temp_dir.path()).unwrap()));
        assert_eq!(manager.storage().name(), "file");
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = SessionConfig {
            ttl_secs: 120,
            storage: StorageConfig::Memory(MemoryConfig::default()),
        };
        let manager = Manager::from_config(&config).await.unwrap();

        assert_eq!(manager.storage().name(), "memory");
        assert_eq!(manager.ttl(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_from_config_rejects_oversized_ttl() {
        let config = SessionConfig {
            ttl_secs: u64::MAX,
            storage: StorageConfig::Memory(MemoryConfig::default()),
        };
        assert!(Manager::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_handing_out_sessions_does_no_io() {
        let storage = Arc::new(kvsession_storage::testing::CountingStorage::new(Arc::new(
            MemoryStorage::new(),
        )));
        let manager = Manager::with_storage(Duration::from_secs(60), storage.clone());

        let _fresh = manager.new_session();
        let _bound = manager.session("existing");

        assert_eq!(storage.calls("get_session"), 0);
        assert_eq!(storage.calls("new_id"), 0);
    }
}
