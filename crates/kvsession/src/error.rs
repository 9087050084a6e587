//! Session errors

use kvsession_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The id or id generator was changed after the session started
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is closed")]
    Closed,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
