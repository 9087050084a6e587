//! End-to-end session scenarios

use kvsession::storage::testing::FakeRemote;
use kvsession::storage::{FileStorage, RedisHashStorage, RemoteClient};
use kvsession::{Manager, SessionError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_file_session_lives_for_its_ttl() {
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::with_storage(
        Duration::from_secs(1),
        Arc::new(FileStorage::new(temp_dir.path()).unwrap()),
    );

    let mut session = manager.new_session();
    session.set("k1", "v1").await.unwrap();
    session.set("k2", "v2").await.unwrap();
    let id = session.id().await.unwrap();
    session.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    // Not closed, so this read does not refresh the TTL
    let mut early = manager.session(id.clone());
    assert_eq!(early.get("k1").await.unwrap(), Some(json!("v1")));
    drop(early);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let mut late = manager.session(id);
    assert_eq!(late.get("k1").await.unwrap(), None);
    assert_eq!(late.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_file_session_read_extends_its_life() {
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::with_storage(
        Duration::from_secs(1),
        Arc::new(FileStorage::new(temp_dir.path()).unwrap()),
    );

    let mut session = manager.new_session();
    session.set("k1", "v1").await.unwrap();
    let id = session.id().await.unwrap();
    session.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut reader = manager.session(id.clone());
    assert_eq!(reader.get("k1").await.unwrap(), Some(json!("v1")));
    reader.close().await.unwrap();

    // 1.4s after the write, 0.7s after the refresh
    tokio::time::sleep(Duration::from_millis(700)).await;
    let mut later = manager.session(id);
    assert_eq!(later.get("k1").await.unwrap(), Some(json!("v1")));
}

#[tokio::test]
async fn test_hash_sessions_are_isolated() {
    let remote: Arc<dyn RemoteClient> = Arc::new(FakeRemote::new());
    let manager = Manager::with_storage(
        Duration::from_secs(60),
        Arc::new(RedisHashStorage::with_prefix(remote, "sess:")),
    );

    let mut a = manager.new_session();
    let mut b = manager.new_session();
    a.set("owner", "a").await.unwrap();
    a.set("only_in_a", true).await.unwrap();

    assert_eq!(b.get("owner").await.unwrap(), None);
    assert_eq!(b.size().await.unwrap(), 0);
    b.set("owner", "b").await.unwrap();
    assert_eq!(a.get("owner").await.unwrap(), Some(json!("a")));

    let a_id = a.id().await.unwrap();
    assert_ne!(a_id, b.id().await.unwrap());
    a.close().await.unwrap();
    b.close().await.unwrap();

    // Same id, same data
    let mut a_again = manager.session(a_id);
    assert_eq!(a_again.get("only_in_a").await.unwrap(), Some(json!(true)));
    assert_eq!(a_again.size().await.unwrap(), 2);
}

#[tokio::test]
async fn test_hash_session_writes_land_immediately() {
    let fake = Arc::new(FakeRemote::new());
    let remote: Arc<dyn RemoteClient> = fake.clone();
    let manager = Manager::with_storage(
        Duration::from_secs(60),
        Arc::new(RedisHashStorage::new(remote)),
    );

    let mut session = manager.new_session();
    session.set("k", "v").await.unwrap();
    let id = session.id().await.unwrap();

    // Visible to another session before the first one closes
    let mut other = manager.session(id.clone());
    assert_eq!(other.get("k").await.unwrap(), Some(json!("v")));
    assert_eq!(fake.hget_raw(&id, "k"), Some("\"v\"".to_string()));

    session.close().await.unwrap();
    assert_eq!(fake.ttl_of(&id), Some(60));
}

#[tokio::test]
async fn test_set_id_after_first_access_fails() {
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::with_storage(
        Duration::from_secs(60),
        Arc::new(FileStorage::new(temp_dir.path()).unwrap()),
    );

    let mut session = manager.new_session();
    assert_eq!(session.size().await.unwrap(), 0);
    let id = session.id().await.unwrap();

    let result = session.set_id("x");
    assert!(matches!(result, Err(SessionError::AlreadyStarted)));
    assert_eq!(session.id().await.unwrap(), id);
}

#[tokio::test]
async fn test_set_id_before_first_access_binds_session() {
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::with_storage(
        Duration::from_secs(60),
        Arc::new(FileStorage::new(temp_dir.path()).unwrap()),
    );

    let mut session = manager.new_session();
    session.set_id("chosen_id").unwrap();
    session.set("k", 1).await.unwrap();
    session.close().await.unwrap();

    assert!(temp_dir.path().join("chosen_id.session").exists());
}
