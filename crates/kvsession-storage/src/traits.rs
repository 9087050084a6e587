//! Storage trait definitions

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key/value bag of one session
pub type SessionData = HashMap<String, Value>;

/// Outcome of a storage operation a backend may choose not to implement.
///
/// `Unsupported` is not a failure: the backend delegates that concern to the
/// session (usually its in-memory copy). Real failures travel as `StorageError`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Capability<T> {
    Supported(T),
    Unsupported,
}

impl<T> Capability<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Capability::Supported(_))
    }

    /// Value if the backend handled the call
    pub fn supported(self) -> Option<T> {
        match self {
            Capability::Supported(value) => Some(value),
            Capability::Unsupported => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Capability<U> {
        match self {
            Capability::Supported(value) => Capability::Supported(f(value)),
            Capability::Unsupported => Capability::Unsupported,
        }
    }
}

/// How a backend keeps session data consistent with a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Whole map is loaded on start and written back on close
    Mirrored,
    /// Each field mutation is forwarded to the backend immediately
    Direct,
}

/// Contract every session backend implements.
///
/// Every operation defaults to `Capability::Unsupported`, so a backend only
/// overrides what it can do efficiently. A mirrored backend typically implements
/// `get_session`, `set_session`, `update_ttl` and `remove_all`; a direct backend
/// implements the field-level operations.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    fn mode(&self) -> StorageMode {
        StorageMode::Mirrored
    }

    /// Mint a new session id
    async fn new_id(&self, _ttl: Duration) -> StorageResult<Capability<String>> {
        Ok(Capability::Unsupported)
    }

    /// Get one field
    async fn get(&self, _id: &str, _key: &str) -> StorageResult<Capability<Option<Value>>> {
        Ok(Capability::Unsupported)
    }

    /// Number of fields in the session
    async fn get_size(&self, _id: &str) -> StorageResult<Capability<usize>> {
        Ok(Capability::Unsupported)
    }

    /// All fields of the session
    async fn data(&self, _id: &str) -> StorageResult<Capability<SessionData>> {
        Ok(Capability::Unsupported)
    }

    /// Set one field
    async fn set(
        &self,
        _id: &str,
        _key: &str,
        _value: Value,
        _ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }

    /// Set several fields at once
    async fn set_map(
        &self,
        _id: &str,
        _data: SessionData,
        _ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }

    /// Remove one field
    async fn remove(&self, _id: &str, _key: &str) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }

    /// Remove the whole session
    async fn remove_all(&self, _id: &str) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }

    /// Load the whole session.
    ///
    /// `Supported(None)` means absent or expired, which is not an error.
    async fn get_session(
        &self,
        _id: &str,
        _ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        Ok(Capability::Unsupported)
    }

    /// Persist the whole session and reset its expiry
    async fn set_session(
        &self,
        _id: &str,
        _data: &SessionData,
        _ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }

    /// Reset the expiry of an existing session without rewriting its data
    async fn update_ttl(&self, _id: &str, _ttl: Duration) -> StorageResult<Capability<()>> {
        Ok(Capability::Unsupported)
    }
}
