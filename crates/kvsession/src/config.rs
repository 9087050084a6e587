//! Session manager configuration

use crate::error::SessionResult;
use kvsession_storage::{StorageConfig, StorageError, load_config_file};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default session TTL (24 hours)
pub const DEFAULT_TTL_SECS: u64 = 86_400;

/// Longest accepted session TTL (10 years)
pub const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Session time-to-live in seconds
    pub ttl_secs: u64,
    pub storage: StorageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            storage: StorageConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from a `.json`, `.yaml`/`.yml` or `.toml` file and validate
    pub fn load(path: impl AsRef<Path>) -> SessionResult<Self> {
        let config: SessionConfig = load_config_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.ttl_secs == 0 {
            return Err(StorageError::Config("ttl_secs must be greater than 0".to_string()).into());
        }
        if self.ttl_secs > MAX_TTL_SECS {
            return Err(StorageError::Config(format!(
                "ttl_secs must be at most {} (got {})",
                MAX_TTL_SECS, self.ttl_secs
            ))
            .into());
        }
        self.storage.validate()?;
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use kvsession_storage::{FileConfig, MemoryConfig};
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.storage, StorageConfig::File(FileConfig::default()));
    }

    #[test]
    fn test_load_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.yaml");
        std::fs::write(
            &path,
            "ttl_secs: 600\nstorage:\n  backend: memory\n  cleanup_interval_ms: 1000\n",
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.ttl_secs, 600);
        assert_eq!(
            config.storage,
            StorageConfig::Memory(MemoryConfig {
                cleanup_interval_ms: 1000
            })
        );
    }

    #[test]
    fn test_load_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.toml");
        std::fs::write(
            &path,
            "ttl_secs = 60\n\n[storage]\nbackend = \"redis_hash\"\nurl = \"redis://127.0.0.1:6379\"\nprefix = \"s:\"\n",
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.storage.backend_name(), "redis_hash");
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        std::fs::write(&path, r#"{"ttl_secs": 0}"#).unwrap();

        assert!(matches!(
            SessionConfig::load(&path),
            Err(SessionError::Storage(StorageError::Config(_)))
        ));
    }

    #[test]
    fn test_oversized_ttl_is_rejected() {
        let mut config = SessionConfig {
            ttl_secs: u64::MAX,
            storage: StorageConfig::Memory(MemoryConfig::default()),
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::Storage(StorageError::Config(_)))
        ));

        config.ttl_secs = MAX_TTL_SECS;
        assert!(config.validate().is_ok());
    }
}
