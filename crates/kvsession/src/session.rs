//! Session state machine
//!
//! A `Session` is `Unstarted` until the first data access, which loads the
//! stored data (or mints an id). It stays `Started` until `close()` writes it
//! back, after which it is `Closed` and rejects further access.
//!
//! How data flows depends on the backend's `StorageMode`:
//! - `Mirrored`: the whole map is held locally and written back on close if
//!   dirty, otherwise only its TTL is refreshed.
//! - `Direct`: every field access goes to the backend; a local map is used only
//!   for operations the backend reports as unsupported.

use crate::error::{SessionError, SessionResult};
use kvsession_storage::{Capability, SessionData, Storage, StorageMode, new_session_id};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// User-supplied session id generator, called with the session TTL
pub type IdFn = Arc<dyn Fn(Duration) -> String + Send + Sync>;

enum State {
    Unstarted,
    Started(Backing),
    Closed,
}

enum Backing {
    Mirrored {
        data: SessionData,
    },
    Direct {
        /// The backend already held this session when it started
        existed: bool,
        fallback: SessionData,
    },
}

/// One user's session. Not shared between tasks: create one per request and
/// `close()` it when done.
pub struct Session {
    storage: Arc<dyn Storage>,
    ttl: Duration,
    id: Option<String>,
    id_fn: Option<IdFn>,
    state: State,
    dirty: bool,
}

impl Session {
    pub(crate) fn new(storage: Arc<dyn Storage>, ttl: Duration, id: Option<String>) -> Self {
        Self {
            storage,
            ttl,
            id: id.filter(|id| !id.is_empty()),
            id_fn: None,
            state: State::Unstarted,
            dirty: false,
        }
    }

    async fn start(&mut self) -> SessionResult<()> {
        match self.state {
            State::Unstarted => {}
            State::Started(_) => return Ok(()),
            State::Closed => return Err(SessionError::Closed),
        }

        let mut loaded = None;
        if let Some(id) = &self.id {
            // Unsupported and absent both mean "start empty"
            loaded = self
                .storage
                .get_session(id, self.ttl)
                .await?
                .supported()
                .flatten();
        }
        let existed = loaded.is_some();

        if self.id.is_none() {
            self.id = Some(self.generate_id().await?);
        }

        let backing = match self.storage.mode() {
            StorageMode::Mirrored => Backing::Mirrored {
                data: loaded.unwrap_or_default(),
            },
            StorageMode::Direct => Backing::Direct {
                existed,
                fallback: SessionData::new(),
            },
        };
        self.state = State::Started(backing);

        tracing::debug!(
            session_id = self.id.as_deref().unwrap_or_default(),
            backend = self.storage.name(),
            existed,
            "Session started"
        );
        Ok(())
    }

    async fn generate_id(&self) -> SessionResult<String> {
        if let Capability::Supported(id) = self.storage.new_id(self.ttl).await? {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        if let Some(id_fn) = &self.id_fn {
            let id = id_fn(self.ttl);
            if !id.is_empty() {
                return Ok(id);
            }
        }
        Ok(new_session_id())
    }

    /// Start if needed and hand out what every data operation works on
    async fn started(&mut self) -> SessionResult<(&dyn Storage, &str, &mut Backing)> {
        self.start().await?;
        match (&mut self.state, self.id.as_deref()) {
            (State::Started(backing), Some(id)) => Ok((self.storage.as_ref(), id, backing)),
            _ => Err(SessionError::Closed),
        }
    }

    /// Set one key
    pub async fn set<T: Serialize>(&mut self, key: &str, value: T) -> SessionResult<()> {
        let value = serde_json::to_value(value)?;
        let ttl = self.ttl;
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => {
                data.insert(key.to_string(), value);
            }
            Backing::Direct { fallback, .. } => {
                if let Capability::Unsupported = storage.set(id, key, value.clone(), ttl).await? {
                    fallback.insert(key.to_string(), value);
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Set several keys at once
    pub async fn set_map(&mut self, entries: SessionData) -> SessionResult<()> {
        let ttl = self.ttl;
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => data.extend(entries),
            Backing::Direct { fallback, .. } => {
                if let Capability::Unsupported = storage.set_map(id, entries.clone(), ttl).await? {
                    fallback.extend(entries);
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove the given keys
    pub async fn remove(&mut self, keys: &[&str]) -> SessionResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => {
                for key in keys {
                    data.remove(*key);
                }
            }
            Backing::Direct { fallback, .. } => {
                for key in keys {
                    if let Capability::Unsupported = storage.remove(id, key).await? {
                        fallback.remove(*key);
                    }
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove every key. A mirrored session emptied this way is deleted from
    /// storage on close.
    pub async fn remove_all(&mut self) -> SessionResult<()> {
        if matches!(self.state, State::Unstarted) && self.id.is_none() {
            // Nothing stored yet; do not mint an id just to delete nothing
            return Ok(());
        }
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => data.clear(),
            Backing::Direct { fallback, .. } => {
                if let Capability::Unsupported = storage.remove_all(id).await? {
                    fallback.clear();
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Value of `key`, `None` if absent
    pub async fn get(&mut self, key: &str) -> SessionResult<Option<Value>> {
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => Ok(data.get(key).cloned()),
            Backing::Direct { fallback, .. } => match storage.get(id, key).await? {
                Capability::Supported(value) => Ok(value),
                Capability::Unsupported => Ok(fallback.get(key).cloned()),
            },
        }
    }

    /// Value of `key`, or `default` if absent
    pub async fn get_or(&mut self, key: &str, default: Value) -> SessionResult<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Value of `key` deserialized into `T`
    pub async fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> SessionResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Copy of all keys and values
    pub async fn data(&mut self) -> SessionResult<SessionData> {
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => Ok(data.clone()),
            Backing::Direct { fallback, .. } => match storage.data(id).await? {
                Capability::Supported(data) => Ok(data),
                Capability::Unsupported => Ok(fallback.clone()),
            },
        }
    }

    /// Number of keys
    pub async fn size(&mut self) -> SessionResult<usize> {
        let (storage, id, backing) = self.started().await?;

        match backing {
            Backing::Mirrored { data } => Ok(data.len()),
            Backing::Direct { fallback, .. } => match storage.get_size(id).await? {
                Capability::Supported(size) => Ok(size),
                Capability::Unsupported => Ok(fallback.len()),
            },
        }
    }

    pub async fn contains(&mut self, key: &str) -> SessionResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Session id, minting one if the session has none yet
    pub async fn id(&mut self) -> SessionResult<String> {
        let (_, id, _) = self.started().await?;
        Ok(id.to_string())
    }

    /// Bind the session to `id`. Only allowed before the first data access.
    pub fn set_id(&mut self, id: impl Into<String>) -> SessionResult<()> {
        self.ensure_unstarted()?;
        let id = id.into();
        self.id = (!id.is_empty()).then_some(id);
        Ok(())
    }

    /// Generate the id with `id_fn` if the backend does not mint one. Only
    /// allowed before the first data access.
    pub fn set_id_fn<F>(&mut self, id_fn: F) -> SessionResult<()>
    where
        F: Fn(Duration) -> String + Send + Sync + 'static,
    {
        self.ensure_unstarted()?;
        self.id_fn = Some(Arc::new(id_fn));
        Ok(())
    }

    fn ensure_unstarted(&self) -> SessionResult<()> {
        match self.state {
            State::Unstarted => Ok(()),
            _ => Err(SessionError::AlreadyStarted),
        }
    }

    /// Whether the session was mutated since it started
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, State::Started(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist the session. Dirty sessions are written back, clean non-empty
    /// ones only get their TTL refreshed.
    ///
    /// On error the session stays open so the call can be retried.
    pub async fn close(&mut self) -> SessionResult<()> {
        let (State::Started(backing), Some(id)) = (&self.state, self.id.as_deref()) else {
            // Never accessed, nothing to persist
            self.state = State::Closed;
            return Ok(());
        };
        let storage = self.storage.as_ref();
        let ttl = self.ttl;

        match backing {
            Backing::Mirrored { data } if self.dirty && data.is_empty() => {
                if let Capability::Unsupported = storage.remove_all(id).await? {
                    let _ = storage.set_session(id, data, ttl).await?;
                }
            }
            Backing::Mirrored { data } if self.dirty => {
                if let Capability::Unsupported = storage.set_session(id, data, ttl).await? {
                    tracing::debug!(session_id = %id, backend = storage.name(), "Backend does not persist whole sessions");
                }
            }
            Backing::Mirrored { data } if !data.is_empty() => {
                let _ = storage.update_ttl(id, ttl).await?;
            }
            Backing::Mirrored { .. } => {}
            Backing::Direct { fallback, .. } if self.dirty => {
                let _ = storage.set_session(id, fallback, ttl).await?;
            }
            Backing::Direct { existed, fallback } if *existed || !fallback.is_empty() => {
                let _ = storage.update_ttl(id, ttl).await?;
            }
            Backing::Direct { .. } => {}
        }

        tracing::debug!(session_id = %id, dirty = self.dirty, "Session closed");
        self.state = State::Closed;
        self.dirty = false;
        Ok(())
    }

    pub async fn must_set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Err(e) = self.set(key, value).await {
            panic!("Session set failed: {}", e);
        }
    }

    pub async fn must_set_map(&mut self, entries: SessionData) {
        if let Err(e) = self.set_map(entries).await {
            panic!("Session set_map failed: {}", e);
        }
    }

    pub async fn must_remove(&mut self, keys: &[&str]) {
        if let Err(e) = self.remove(keys).await {
            panic!("Session remove failed: {}", e);
        }
    }

    pub async fn must_remove_all(&mut self) {
        if let Err(e) = self.remove_all().await {
            panic!("Session remove_all failed: {}", e);
        }
    }

    pub async fn must_get(&mut self, key: &str) -> Option<Value> {
        match self.get(key).await {
            Ok(value) => value,
            Err(e) => panic!("Session get failed: {}", e),
        }
    }

    pub async fn must_data(&mut self) -> SessionData {
        match self.data().await {
            Ok(data) => data,
            Err(e) => panic!("Session data failed: {}", e),
        }
    }

    pub async fn must_size(&mut self) -> usize {
        match self.size().await {
            Ok(size) => size,
            Err(e) => panic!("Session size failed: {}", e),
        }
    }

    pub async fn must_contains(&mut self, key: &str) -> bool {
        match self.contains(key).await {
            Ok(found) => found,
            Err(e) => panic!("Session contains failed: {}", e),
        }
    }

    pub async fn must_id(&mut self) -> String {
        match self.id().await {
            Ok(id) => id,
            Err(e) => panic!("Session id failed: {}", e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.dirty && matches!(self.state, State::Started(_)) {
            tracing::warn!(
                session_id = self.id.as_deref().unwrap_or_default(),
                "Session dropped with unsaved changes; call close() to persist"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Unstarted => "unstarted",
            State::Started(_) => "started",
            State::Closed => "closed",
        };
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &state)
            .field("dirty", &self.dirty)
            .field("ttl", &self.ttl)
            .finish()
    }
}
