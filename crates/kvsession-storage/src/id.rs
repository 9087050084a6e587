//! Session id generation and validation

use crate::traits::{StorageError, StorageResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Random bytes behind every generated id
pub const SESSION_ID_BYTES: usize = 24;

/// Longest id accepted by backends that map ids onto file names
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Generate a new random, URL-safe session id
pub fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Validate a session id to prevent path traversal attacks
pub fn validate_session_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::InvalidData("Session ID cannot be empty".into()));
    }

    if id.len() > MAX_SESSION_ID_LEN {
        return Err(StorageError::InvalidData(format!(
            "Session ID too long: {} chars (max {})",
            id.len(),
            MAX_SESSION_ID_LEN
        )));
    }

    let is_valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !is_valid {
        return Err(StorageError::InvalidData(format!(
            "Invalid session ID '{}': only alphanumeric, dash, and underscore allowed",
            id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_valid_and_url_safe() {
        for _ in 0..100 {
            let id = new_session_id();
            // 24 bytes -> 32 base64 chars without padding
            assert_eq!(id.len(), 32);
            validate_session_id(&id).unwrap();
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_session_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_rejects_path_traversal() {
        for id in ["../etc/passwd", "a/b", "a\\b", "./x", ".."] {
            assert!(validate_session_id(id).is_err(), "should reject {}", id);
        }
    }

    #[test]
    fn test_rejects_empty_and_too_long() {
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN)).is_ok());
    }

    #[test]
    fn test_rejects_non_ascii() {
        assert!(validate_session_id("séssion").is_err());
        assert!(validate_session_id("session id").is_err());
    }
}
