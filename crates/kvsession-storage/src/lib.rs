//! kvsession Storage
//!
//! This crate provides the storage side of the session store:
//! - The `Storage` trait every backend implements, with "unsupported" defaults
//! - File backend (one file per session, optional AES-256-GCM, batched TTL refresh)
//! - Memory backend (in-process cache with per-entry expiry)
//! - Redis blob backend (whole session under one key, batched EXPIRE)
//! - Redis hash backend (one hash field per session key, direct writes)

pub mod atomic_writer;
pub mod batch;
pub mod config;
pub mod encryption;
pub mod file;
pub mod id;
pub mod memory;
pub mod redis_blob;
pub mod redis_hash;
pub mod remote;
pub mod traits;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use batch::{BatchConfig, TtlBatcher, TtlSink};
pub use config::{
    ConfigFormat, FileConfig, MemoryConfig, RedisConfig, RedisHashConfig, StorageConfig,
    load_config_file,
};
pub use encryption::CryptoKey;
pub use file::{FileStorage, FileStorageOptions};
pub use id::{new_session_id, validate_session_id};
pub use memory::{MemoryStorage, TtlCache};
pub use redis_blob::{RedisStorage, RedisStorageOptions};
pub use redis_hash::RedisHashStorage;
pub use remote::RemoteClient;
#[cfg(feature = "redis")]
pub use remote::RedisClient;
pub use traits::{Capability, SessionData, Storage, StorageError, StorageMode, StorageResult};
