//! kvsession
//!
//! TTL-bounded key/value sessions addressed by an opaque id:
//! - `Manager` holds a storage backend and the default TTL and hands out sessions
//! - `Session` loads lazily on first access, tracks whether it was mutated and
//!   writes back (or only refreshes its TTL) on `close()`
//! - `SessionConfig` builds a manager from a JSON, YAML or TOML file
//!
//! Backends live in `kvsession-storage` and are re-exported as `storage`.

pub mod config;
pub mod error;
pub mod manager;
pub mod session;

pub use kvsession_storage as storage;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use kvsession_storage::{SessionData, Storage, StorageConfig, StorageError};
pub use manager::Manager;
pub use session::{IdFn, Session};
