//! File-based session storage
//!
//! One file per session, `<dir>/<id>.session`:
//!
//! ```text
//! [8 bytes: last-touched timestamp, milliseconds, big-endian][JSON map, optionally encrypted]
//! ```
//!
//! Reads never delete: an expired file simply reads as absent. Expired files are
//! reclaimed by a background sweep. TTL refreshes only rewrite the 8-byte header
//! and are batched through a `TtlBatcher`.

use crate::atomic_writer::{AtomicWriter, TEMP_SUFFIX};
use crate::batch::{BatchConfig, TtlBatcher, TtlSink};
use crate::encryption::CryptoKey;
use crate::id::validate_session_id;
use crate::traits::{Capability, SessionData, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Extension of session files
pub const SESSION_FILE_EXT: &str = "session";

/// Length of the timestamp header
pub const HEADER_LEN: usize = 8;

/// Default interval of the expired-file sweep
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Temp files older than this belong to writes that died before committing
const STALE_TEMP_AGE: Duration = Duration::from_secs(600);

/// Options for a file session store
#[derive(Debug, Clone)]
pub struct FileStorageOptions {
    /// Encrypt payloads with this key
    pub crypto_key: Option<CryptoKey>,
    /// Batching of header-only TTL refreshes
    pub batch: BatchConfig,
    /// Interval of the expired-file sweep
    pub gc_interval: Duration,
    /// TTL the sweep assumes before any operation has reported one
    pub ttl_hint: Option<Duration>,
}

impl Default for FileStorageOptions {
    fn default() -> Self {
        Self {
            crypto_key: None,
            batch: BatchConfig::default(),
            gc_interval: DEFAULT_GC_INTERVAL,
            ttl_hint: None,
        }
    }
}

/// File-based session store
pub struct FileStorage {
    inner: Arc<FileInner>,
    batcher: TtlBatcher,
    gc_handle: JoinHandle<()>,
}

struct FileInner {
    dir: PathBuf,
    crypto_key: Option<CryptoKey>,
    /// Longest TTL seen so far; the sweep never deletes a file younger than this
    max_ttl_ms: AtomicU64,
}

impl FileStorage {
    /// Open a file session store in an existing, writable directory.
    /// Must be called from within a Tokio runtime.
    pub fn new<P: AsRef<Path>>(dir: P) -> StorageResult<Self> {
        Self::with_options(dir, FileStorageOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(dir: P, options: FileStorageOptions) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        ensure_writable_dir(&dir)?;

        let max_ttl_ms = options.ttl_hint.map(duration_ms).unwrap_or(0);
        let inner = Arc::new(FileInner {
            dir,
            crypto_key: options.crypto_key,
            max_ttl_ms: AtomicU64::new(max_ttl_ms),
        });

        let batcher = TtlBatcher::spawn(Arc::clone(&inner), options.batch);
        let gc_handle = spawn_gc(Arc::downgrade(&inner), options.gc_interval);

        tracing::debug!(dir = %inner.dir.display(), "File session storage opened");

        Ok(Self {
            inner,
            batcher,
            gc_handle,
        })
    }

    /// Directory used when none is configured
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("kvsessions")
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the file holding `session_id`
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.inner.path(session_id)
    }

    /// Delete every expired session file now; returns how many were removed
    pub fn clear_expired(&self) -> StorageResult<usize> {
        self.inner.clear_expired()
    }

    /// Write all batched TTL refreshes now; returns how many were written
    pub async fn flush_ttl(&self) -> usize {
        self.batcher.flush().await
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        self.gc_handle.abort();
    }
}

impl FileInner {
    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", session_id, SESSION_FILE_EXT))
    }

    fn observe_ttl(&self, ttl: Duration) {
        self.max_ttl_ms.fetch_max(duration_ms(ttl), Ordering::Relaxed);
    }

    fn read(&self, session_id: &str, ttl: Duration) -> StorageResult<Option<SessionData>> {
        // No file can exist under an id we would refuse to write
        if let Err(e) = validate_session_id(session_id) {
            tracing::debug!(error = %e, "Invalid session id reads as absent");
            return Ok(None);
        }
        self.observe_ttl(ttl);

        let bytes = match fs::read(self.path(session_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((touched_at, payload)) = split_header(&bytes) else {
            tracing::warn!(session_id = %session_id, "Session file shorter than its header, ignoring");
            return Ok(None);
        };

        if is_expired(touched_at, ttl, now_ms()) {
            return Ok(None);
        }

        decode_payload(payload, self.crypto_key.as_ref()).map(Some)
    }

    fn write(&self, session_id: &str, data: &SessionData, ttl: Duration) -> StorageResult<()> {
        validate_session_id(session_id)?;
        self.observe_ttl(ttl);

        let json = serde_json::to_vec(data)?;
        let payload = match &self.crypto_key {
            Some(key) => key.encrypt(&json)?,
            None => json,
        };

        let header = now_ms().to_be_bytes();
        AtomicWriter::write_parts(self.path(session_id), &[header.as_slice(), payload.as_slice()])
    }

    /// Rewrite only the timestamp header. A session that expired since the
    /// touch was queued stays expired.
    fn touch(&self, session_id: &str, ttl: Duration) -> StorageResult<bool> {
        if validate_session_id(session_id).is_err() {
            return Ok(false);
        }

        let path = self.path(session_id);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            // Removed since the touch was queued
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut stamp = [0u8; HEADER_LEN];
        match file.read_exact(&mut stamp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let now = now_ms();
        if is_expired(i64::from_be_bytes(stamp), ttl, now) {
            tracing::debug!(session_id = %session_id, "Skipping TTL refresh of expired session");
            return Ok(false);
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&now.to_be_bytes())?;
        Ok(true)
    }

    fn remove(&self, session_id: &str) -> StorageResult<()> {
        if validate_session_id(session_id).is_err() {
            return Ok(());
        }

        match fs::remove_file(self.path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_expired(&self) -> StorageResult<usize> {
        self.clear_stale_temp_files()?;

        let ttl_ms = self.max_ttl_ms.load(Ordering::Relaxed);
        if ttl_ms == 0 {
            // No TTL known yet, nothing can be judged expired
            return Ok(0);
        }
        let ttl = Duration::from_millis(ttl_ms);
        let now = now_ms();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_session = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == SESSION_FILE_EXT);
            if !is_session {
                continue;
            }

            let touched_at = match read_header(&path) {
                Ok(touched_at) => touched_at,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    continue;
                }
            };

            if is_expired(touched_at, ttl, now) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to delete expired session file");
                    }
                }
            }
        }

        Ok(removed)
    }

    /// Delete temp files left behind by writes that never reached the rename
    fn clear_stale_temp_files(&self) -> StorageResult<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !is_temp_file(&path) {
                continue;
            }

            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > STALE_TEMP_AGE);
            if !stale {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete stale temp file");
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Deleted stale session temp files");
        }
        Ok(removed)
    }
}

/// `<id>.session.<hex>.tmp`, as named by `AtomicWriter`
fn is_temp_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(stem) = name.strip_suffix(TEMP_SUFFIX).and_then(|s| s.strip_suffix('.')) else {
        return false;
    };
    stem.rsplit_once('.')
        .is_some_and(|(base, _)| base.ends_with(&format!(".{}", SESSION_FILE_EXT)))
}

#[async_trait]
impl TtlSink for FileInner {
    async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> StorageResult<()> {
        self.touch(session_id, ttl).map(|_| ())
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn remove_all(&self, id: &str) -> StorageResult<Capability<()>> {
        self.inner.remove(id)?;
        Ok(Capability::Supported(()))
    }

    async fn get_session(
        &self,
        id: &str,
        ttl: Duration,
    ) -> StorageResult<Capability<Option<SessionData>>> {
        Ok(Capability::Supported(self.inner.read(id, ttl)?))
    }

    async fn set_session(
        &self,
        id: &str,
        data: &SessionData,
        ttl: Duration,
    ) -> StorageResult<Capability<()>> {
        self.inner.write(id, data, ttl)?;
        Ok(Capability::Supported(()))
    }

    async fn update_ttl(&self, id: &str, ttl: Duration) -> StorageResult<Capability<()>> {
        if validate_session_id(id).is_err() {
            return Ok(Capability::Supported(()));
        }
        self.inner.observe_ttl(ttl);

        // A TTL shorter than the batch interval could lapse before the drain
        if ttl < self.batcher.interval() || !self.batcher.touch(id, ttl) {
            self.inner.touch(id, ttl)?;
        }
        Ok(Capability::Supported(()))
    }
}

/// Decode the part of a session file after the header
pub fn decode_payload(payload: &[u8], crypto_key: Option<&CryptoKey>) -> StorageResult<SessionData> {
    if payload.is_empty() {
        return Ok(SessionData::new());
    }

    let json = match crypto_key {
        Some(key) => key.decrypt(payload)?,
        None => payload.to_vec(),
    };
    Ok(serde_json::from_slice(&json)?)
}

/// Split a session file into its timestamp and payload
pub fn split_header(bytes: &[u8]) -> Option<(i64, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let mut stamp = [0u8; HEADER_LEN];
    stamp.copy_from_slice(header);
    Some((i64::from_be_bytes(stamp), payload))
}

/// Read just the timestamp header of a session file
pub fn read_header(path: &Path) -> StorageResult<i64> {
    let mut stamp = [0u8; HEADER_LEN];
    File::open(path)?.read_exact(&mut stamp).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            StorageError::InvalidData(format!("{} has no header", path.display()))
        } else {
            StorageError::Io(e)
        }
    })?;
    Ok(i64::from_be_bytes(stamp))
}

pub fn is_expired(touched_at_ms: i64, ttl: Duration, now_ms: i64) -> bool {
    touched_at_ms.saturating_add(duration_ms(ttl) as i64) < now_ms
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX / 2)
}

fn ensure_writable_dir(dir: &Path) -> StorageResult<()> {
    let metadata = fs::metadata(dir).map_err(|e| {
        StorageError::Config(format!(
            "Session directory {} is not accessible: {}",
            dir.display(),
            e
        ))
    })?;
    if !metadata.is_dir() {
        return Err(StorageError::Config(format!(
            "Session path {} is not a directory",
            dir.display()
        )));
    }

    let probe = dir.join(format!(".probe-{}", crate::id::new_session_id()));
    File::create(&probe).map_err(|e| {
        StorageError::Config(format!(
            "Session directory {} is not writable: {}",
            dir.display(),
            e
        ))
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

fn spawn_gc(inner: Weak<FileInner>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };

            match tokio::task::spawn_blocking(move || inner.clear_expired()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => tracing::info!(removed, "Deleted expired session files"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Session file sweep failed"),
                Err(e) => tracing::error!(error = %e, "Session file sweep panicked"),
            }
        }
    })
}
