//! Backend configuration and config file loading

use crate::batch::{BatchConfig, DEFAULT_FLUSH_INTERVAL};
use crate::encryption::CryptoKey;
use crate::file::{DEFAULT_GC_INTERVAL, FileStorage, FileStorageOptions};
use crate::memory::{DEFAULT_CLEANUP_INTERVAL, MemoryStorage};
use crate::remote::DEFAULT_COMMAND_TIMEOUT;
use crate::traits::{Storage, StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which backend to build, with its settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    File(FileConfig),
    Memory(MemoryConfig),
    Redis(RedisConfig),
    RedisHash(RedisHashConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File(FileConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Session directory (default: `<temp>/kvsessions`, created if missing)
    pub path: Option<PathBuf>,
    /// 32-byte key; enables payload encryption when set
    pub crypto_key: Option<String>,
    pub ttl_flush_interval_ms: u64,
    pub gc_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: None,
            crypto_key: None,
            ttl_flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            gc_interval_secs: DEFAULT_GC_INTERVAL.as_secs(),
            channel_capacity: BatchConfig::default().channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub cleanup_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub ttl_flush_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisHashConfig {
    pub url: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL.as_millis() as u64
}

fn require_positive(name: &str, value: u64) -> StorageResult<()> {
    if value == 0 {
        return Err(StorageError::Config(format!("{} must be greater than 0", name)));
    }
    Ok(())
}

fn require_url(url: &str) -> StorageResult<()> {
    if url.trim().is_empty() {
        return Err(StorageError::Config("Redis url must not be empty".to_string()));
    }
    Ok(())
}

impl StorageConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::File(_) => "file",
            StorageConfig::Memory(_) => "memory",
            StorageConfig::Redis(_) => "redis",
            StorageConfig::RedisHash(_) => "redis_hash",
        }
    }

    /// Check settings without touching the filesystem or network
    pub fn validate(&self) -> StorageResult<()> {
        match self {
            StorageConfig::File(file) => {
                if let Some(key) = &file.crypto_key {
                    CryptoKey::from_bytes(key.as_bytes())?;
                }
                require_positive("ttl_flush_interval_ms", file.ttl_flush_interval_ms)?;
                require_positive("gc_interval_secs", file.gc_interval_secs)?;
                require_positive("channel_capacity", file.channel_capacity as u64)
            }
            StorageConfig::Memory(memory) => {
                require_positive("cleanup_interval_ms", memory.cleanup_interval_ms)
            }
            StorageConfig::Redis(redis) => {
                require_url(&redis.url)?;
                require_positive("command_timeout_ms", redis.command_timeout_ms)?;
                require_positive("ttl_flush_interval_ms", redis.ttl_flush_interval_ms)
            }
            StorageConfig::RedisHash(redis) => {
                require_url(&redis.url)?;
                require_positive("command_timeout_ms", redis.command_timeout_ms)
            }
        }
    }

    /// Build the configured backend. `ttl` is the session TTL the backend
    /// will be asked to honour. Must be called from within a Tokio runtime.
    pub async fn build(&self, ttl: Duration) -> StorageResult<Arc<dyn Storage>> {
        self.validate()?;

        let storage: Arc<dyn Storage> = match self {
            StorageConfig::File(file) => Arc::new(build_file(file, ttl)?),
            StorageConfig::Memory(memory) => Arc::new(MemoryStorage::with_cleanup_interval(
                Duration::from_millis(memory.cleanup_interval_ms),
            )),
            StorageConfig::Redis(redis) => build_redis(redis).await?,
            StorageConfig::RedisHash(redis) => build_redis_hash(redis).await?,
        };

        tracing::debug!(backend = storage.name(), "Session storage ready");
        Ok(storage)
    }
}

fn build_file(config: &FileConfig, ttl: Duration) -> StorageResult<FileStorage> {
    let dir = match &config.path {
        Some(path) => path.clone(),
        None => {
            let dir = FileStorage::default_dir();
            std::fs::create_dir_all(&dir)?;
            dir
        }
    };

    let crypto_key = config
        .crypto_key
        .as_deref()
        .map(|key| CryptoKey::from_bytes(key.as_bytes()))
        .transpose()?;

    let options = FileStorageOptions {
        crypto_key,
        batch: BatchConfig {
            interval: Duration::from_millis(config.ttl_flush_interval_ms),
            channel_capacity: config.channel_capacity,
            ..Default::default()
        },
        gc_interval: Duration::from_secs(config.gc_interval_secs),
        ttl_hint: Some(ttl),
    };
    FileStorage::with_options(dir, options)
}

#[cfg(feature = "redis")]
async fn build_redis(config: &RedisConfig) -> StorageResult<Arc<dyn Storage>> {
    use crate::redis_blob::{RedisStorage, RedisStorageOptions};
    use crate::remote::{RedisClient, RemoteClient};

    let client: Arc<dyn RemoteClient> = Arc::new(
        RedisClient::connect(
            &config.url,
            Duration::from_millis(config.command_timeout_ms),
        )
        .await?,
    );
    let options = RedisStorageOptions {
        prefix: config.prefix.clone(),
        batch: BatchConfig {
            interval: Duration::from_millis(config.ttl_flush_interval_ms),
            ..Default::default()
        },
    };
    Ok(Arc::new(RedisStorage::with_options(client, options)))
}

#[cfg(feature = "redis")]
async fn build_redis_hash(config: &RedisHashConfig) -> StorageResult<Arc<dyn Storage>> {
    use crate::redis_hash::RedisHashStorage;
    use crate::remote::{RedisClient, RemoteClient};

    let client: Arc<dyn RemoteClient> = Arc::new(
        RedisClient::connect(
            &config.url,
            Duration::from_millis(config.command_timeout_ms),
        )
        .await?,
    );
    Ok(Arc::new(RedisHashStorage::with_prefix(
        client,
        config.prefix.clone(),
    )))
}

#[cfg(not(feature = "redis"))]
async fn build_redis(_config: &RedisConfig) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::Config(
        "Redis backend requires the `redis` feature".to_string(),
    ))
}

#[cfg(not(feature = "redis"))]
async fn build_redis_hash(_config: &RedisHashConfig) -> StorageResult<Arc<dyn Storage>> {
    Err(StorageError::Config(
        "Redis backend requires the `redis` feature".to_string(),
    ))
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect config format from file extension
    pub fn detect(path: &Path) -> ConfigFormat {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }

    pub fn parse<T: DeserializeOwned>(self, content: &str) -> StorageResult<T> {
        match self {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| StorageError::Config(format!("JSON parse error: {}", e))),
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| StorageError::Config(format!("YAML parse error: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| StorageError::Config(format!("TOML parse error: {}", e))),
        }
    }
}

/// Read and parse a config file, picking the format from its extension
pub fn load_config_file<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StorageError::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    ConfigFormat::detect(path).parse(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_format() {
        assert_eq!(ConfigFormat::detect(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::detect(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::detect(Path::new("a.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::detect(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::detect(Path::new("a")), ConfigFormat::Json);
    }

    #[test]
    fn test_file_defaults_from_json() {
        let config: StorageConfig = ConfigFormat::Json
            .parse(r#"{"backend": "file"}"#)
            .unwrap();
        assert_eq!(config, StorageConfig::File(FileConfig::default()));
        assert_eq!(config.backend_name(), "file");
    }

    #[test]
    fn test_redis_from_yaml() {
        let yaml = "backend: redis\nurl: redis://127.0.0.1:6379\nprefix: \"sess:\"\n";
        let config: StorageConfig = ConfigFormat::Yaml.parse(yaml).unwrap();

        match config {
            StorageConfig::Redis(redis) => {
                assert_eq!(redis.url, "redis://127.0.0.1:6379");
                assert_eq!(redis.prefix, "sess:");
                assert_eq!(redis.command_timeout_ms, 5000);
                assert_eq!(redis.ttl_flush_interval_ms, 10_000);
            }
            other => panic!("expected redis config, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_from_toml() {
        let toml = "backend = \"memory\"\ncleanup_interval_ms = 500\n";
        let config: StorageConfig = ConfigFormat::Toml.parse(toml).unwrap();
        assert_eq!(
            config,
            StorageConfig::Memory(MemoryConfig {
                cleanup_interval_ms: 500
            })
        );
    }

    #[test]
    fn test_redis_hash_requires_url() {
        let result: StorageResult<StorageConfig> =
            ConfigFormat::Json.parse(r#"{"backend": "redis_hash"}"#);
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result: StorageResult<StorageConfig> =
            ConfigFormat::Json.parse(r#"{"backend": "cassandra"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let short_key = StorageConfig::File(FileConfig {
            crypto_key: Some("short".to_string()),
            ..Default::default()
        });
        assert!(matches!(short_key.validate(), Err(StorageError::Config(_))));

        let zero_interval = StorageConfig::Memory(MemoryConfig {
            cleanup_interval_ms: 0,
        });
        assert!(zero_interval.validate().is_err());

        let empty_url = StorageConfig::RedisHash(RedisHashConfig {
            url: " ".to_string(),
            prefix: String::new(),
            command_timeout_ms: 1000,
        });
        assert!(empty_url.validate().is_err());
    }

    #[tokio::test]
    async fn test_build_file_backend() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::File(FileConfig {
            path: Some(temp_dir.path().to_path_buf()),
            crypto_key: Some("Session storage file crypto key!".to_string()),
            ..Default::default()
        });

        let storage = config.build(Duration::from_secs(60)).await.unwrap();
        assert_eq!(storage.name(), "file");
    }

    #[tokio::test]
    async fn test_build_file_backend_missing_dir_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::File(FileConfig {
            path: Some(temp_dir.path().join("missing")),
            ..Default::default()
        });

        let result = config.build(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_memory_backend() {
        let storage = StorageConfig::Memory(MemoryConfig::default())
            .build(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(storage.name(), "memory");
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("storage.toml");
        std::fs::write(&path, "backend = \"memory\"\n").unwrap();

        let config: StorageConfig = load_config_file(&path).unwrap();
        assert_eq!(config, StorageConfig::Memory(MemoryConfig::default()));

        let missing: StorageResult<StorageConfig> =
            load_config_file(&temp_dir.path().join("nope.json"));
        assert!(matches!(missing, Err(StorageError::Config(_))));
    }
}
