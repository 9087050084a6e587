//! Integration tests for the local backends through the `Storage` trait

use kvsession_storage::{
    Capability, CryptoKey, FileStorage, FileStorageOptions, MemoryStorage, SessionData, Storage,
    StorageConfig, new_session_id,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sample() -> SessionData {
    let mut data = SessionData::new();
    data.insert("k1".to_string(), json!("v1"));
    data.insert("k2".to_string(), json!({"n": 2}));
    data
}

async fn assert_round_trip_and_expiry(storage: Arc<dyn Storage>) {
    let ttl = Duration::from_millis(300);
    let id = new_session_id();

    storage.set_session(&id, &sample(), ttl).await.unwrap();
    assert_eq!(
        storage.get_session(&id, ttl).await.unwrap(),
        Capability::Supported(Some(sample())),
        "{} round trip",
        storage.name()
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        storage.get_session(&id, ttl).await.unwrap(),
        Capability::Supported(None),
        "{} expiry",
        storage.name()
    );
}

#[tokio::test]
async fn test_file_backend_round_trip_and_expiry() {
    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(FileStorage::new(temp_dir.path()).unwrap());
    assert_round_trip_and_expiry(storage).await;
}

#[tokio::test]
async fn test_encrypted_file_backend_round_trip_and_expiry() {
    let temp_dir = TempDir::new().unwrap();
    let options = FileStorageOptions {
        crypto_key: Some(CryptoKey::generate()),
        ..Default::default()
    };
    let storage = Arc::new(FileStorage::with_options(temp_dir.path(), options).unwrap());
    assert_round_trip_and_expiry(storage).await;
}

#[tokio::test]
async fn test_memory_backend_round_trip_and_expiry() {
    assert_round_trip_and_expiry(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test]
async fn test_file_sessions_survive_reopening_the_directory() {
    let temp_dir = TempDir::new().unwrap();
    let key = CryptoKey::generate();
    let ttl = Duration::from_secs(60);
    let options = FileStorageOptions {
        crypto_key: Some(key.clone()),
        ..Default::default()
    };

    {
        let storage = FileStorage::with_options(temp_dir.path(), options.clone()).unwrap();
        storage.set_session("persisted", &sample(), ttl).await.unwrap();
    }

    let reopened = FileStorage::with_options(temp_dir.path(), options).unwrap();
    assert_eq!(
        reopened.get_session("persisted", ttl).await.unwrap(),
        Capability::Supported(Some(sample()))
    );
}

#[tokio::test]
async fn test_batched_touch_keeps_file_session_alive() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FileStorage::new(temp_dir.path()).unwrap();
    // Longer than the flush interval so the touch is queued
    let ttl = Duration::from_secs(20);

    storage.set_session("busy", &sample(), ttl).await.unwrap();
    for _ in 0..100 {
        storage.update_ttl("busy", ttl).await.unwrap();
    }

    assert_eq!(storage.flush_ttl().await, 1);
    assert_eq!(
        storage.get_session("busy", ttl).await.unwrap(),
        Capability::Supported(Some(sample()))
    );
}

#[tokio::test]
async fn test_gc_sweep_reclaims_expired_files() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FileStorage::new(temp_dir.path()).unwrap();
    let ttl = Duration::from_millis(100);

    storage.set_session("short", &sample(), ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Reading does not reclaim space
    assert_eq!(
        storage.get_session("short", ttl).await.unwrap(),
        Capability::Supported(None)
    );
    assert!(storage.session_path("short").exists());

    assert_eq!(storage.clear_expired().unwrap(), 1);
    assert!(!storage.session_path("short").exists());
}

#[tokio::test]
async fn test_storage_config_builds_working_backends() {
    let temp_dir = TempDir::new().unwrap();
    let json = format!(
        r#"{{"backend": "file", "path": {}}}"#,
        serde_json::to_string(temp_dir.path()).unwrap()
    );
    let config: StorageConfig = serde_json::from_str(&json).unwrap();

    let ttl = Duration::from_secs(60);
    let storage = config.build(ttl).await.unwrap();
    storage.set_session("cfg", &sample(), ttl).await.unwrap();

    assert!(temp_dir.path().join("cfg.session").exists());
}
