//! Background coalescing of TTL refreshes
//!
//! Touching a session on every read would cost one disk write or one network
//! round trip per request. Backends instead hand touches to a `TtlBatcher`:
//! a bounded channel feeding a single worker task that keeps the latest TTL per
//! session id and writes each pending id once per interval.

use crate::traits::StorageResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Default flush interval for batched TTL refreshes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Destination of drained TTL refreshes
#[async_trait]
pub trait TtlSink: Send + Sync + 'static {
    async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> StorageResult<()>;
}

/// Configuration for a TTL batcher
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Time between drains
    pub interval: Duration,
    /// Size of the channel buffer (touches beyond this are refreshed inline)
    pub channel_capacity: usize,
    /// Attempts per refresh before it is dropped
    pub max_attempts: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: 10_000,
            max_attempts: 3,
        }
    }
}

enum Command {
    Touch { session_id: String, ttl: Duration },
    Flush(oneshot::Sender<usize>),
}

struct Pending {
    ttl: Duration,
    attempts: u32,
}

/// Handle to a running TTL batch worker.
///
/// Dropping the handle closes the channel; the worker drains whatever is still
/// pending and exits.
pub struct TtlBatcher {
    tx: mpsc::Sender<Command>,
    interval: Duration,
}

impl TtlBatcher {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn spawn<S: TtlSink>(sink: Arc<S>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let interval = config.interval;

        tokio::spawn(async move {
            worker_loop(rx, sink, config).await;
        });

        Self { tx, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queue a refresh (non-blocking).
    /// Returns false if the refresh was not queued and the caller must apply it itself.
    pub fn touch(&self, session_id: &str, ttl: Duration) -> bool {
        let command = Command::Touch {
            session_id: session_id.to_string(),
            ttl,
        };
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %session_id, "TTL batch queue full, refreshing inline");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(session_id = %session_id, "TTL batch worker stopped");
                false
            }
        }
    }

    /// Drain everything queued so far and wait for it.
    /// Returns the number of refreshes written.
    pub async fn flush(&self) -> usize {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).await.is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }
}

async fn worker_loop<S: TtlSink>(
    mut rx: mpsc::Receiver<Command>,
    sink: Arc<S>,
    config: BatchConfig,
) {
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut ticker = tokio::time::interval(config.interval);
    // A drain that overruns the interval skips ticks instead of stacking them
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Touch { session_id, ttl }) => {
                    pending.insert(session_id, Pending { ttl, attempts: 0 });
                }
                Some(Command::Flush(ack)) => {
                    let written = drain(sink.as_ref(), &mut pending, config.max_attempts).await;
                    let _ = ack.send(written);
                }
                None => {
                    drain(sink.as_ref(), &mut pending, config.max_attempts).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    drain(sink.as_ref(), &mut pending, config.max_attempts).await;
                }
            }
        }
    }

    tracing::debug!("TTL batch worker exited");
}

/// Write every pending refresh once. Failures go back into `pending` until
/// they run out of attempts.
async fn drain<S: TtlSink + ?Sized>(
    sink: &S,
    pending: &mut HashMap<String, Pending>,
    max_attempts: u32,
) -> usize {
    let batch = std::mem::take(pending);
    let mut written = 0;

    for (session_id, entry) in batch {
        match sink.refresh_ttl(&session_id, entry.ttl).await {
            Ok(()) => written += 1,
            Err(e) => {
                let attempts = entry.attempts + 1;
                if attempts < max_attempts {
                    tracing::warn!(
                        session_id = %session_id,
                        attempt = attempts,
                        error = %e,
                        "TTL refresh failed, will retry"
                    );
                    pending.insert(
                        session_id,
                        Pending {
                            ttl: entry.ttl,
                            attempts,
                        },
                    );
                } else {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "TTL refresh dropped after {} attempts",
                        attempts
                    );
                }
            }
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        refreshed: Mutex<Vec<(String, Duration)>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl TtlSink for RecordingSink {
        async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> StorageResult<()> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StorageError::Backend("unreachable".to_string()));
            }
            self.refreshed
                .lock()
                .unwrap()
                .push((session_id.to_string(), ttl));
            Ok(())
        }
    }

    fn slow_config() -> BatchConfig {
        BatchConfig {
            interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_repeated_touches_coalesce_into_one_write() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), slow_config());

        for _ in 0..50 {
            assert!(batcher.touch("sess-a", Duration::from_secs(60)));
        }
        batcher.touch("sess-b", Duration::from_secs(60));

        assert_eq!(batcher.flush().await, 2);
        let refreshed = sink.refreshed.lock().unwrap().clone();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(
            refreshed.iter().filter(|(id, _)| id == "sess-a").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_latest_ttl_wins() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), slow_config());

        batcher.touch("sess-a", Duration::from_secs(60));
        batcher.touch("sess-a", Duration::from_secs(120));
        batcher.flush().await;

        let refreshed = sink.refreshed.lock().unwrap().clone();
        assert_eq!(refreshed, vec![("sess-a".to_string(), Duration::from_secs(120))]);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried_on_next_drain() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), slow_config());

        batcher.touch("sess-a", Duration::from_secs(60));
        assert_eq!(batcher.flush().await, 0);
        assert_eq!(batcher.flush().await, 1);
        assert_eq!(sink.refreshed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_dropped_after_max_attempts() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_left.store(10, Ordering::SeqCst);
        let config = BatchConfig {
            max_attempts: 2,
            ..slow_config()
        };
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), config);

        batcher.touch("sess-a", Duration::from_secs(60));
        assert_eq!(batcher.flush().await, 0);
        assert_eq!(batcher.flush().await, 0);
        // Nothing left to retry: the third drain does not call the sink
        sink.failures_left.store(0, Ordering::SeqCst);
        assert_eq!(batcher.flush().await, 0);
        assert!(sink.refreshed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interval_drains_without_explicit_flush() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            interval: Duration::from_millis(50),
            ..Default::default()
        };
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), config);

        batcher.touch("sess-a", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.refreshed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_drains_pending_touches() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = TtlBatcher::spawn(Arc::clone(&sink), slow_config());

        batcher.touch("sess-a", Duration::from_secs(60));
        drop(batcher);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.refreshed.lock().unwrap().len(), 1);
    }
}
