//! Buffered audit log writer
//!
//! Audit records are buffered in memory and written to the store in
//! batches, either when the buffer crosses a size threshold or on a
//! periodic timer. A failed batch write is requeued at the front of the
//! buffer and retried on the next tick, so the dispatch path never blocks
//! on or fails because of audit persistence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keystore::{KeyStore, NewLogEntry};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Serialized payloads are capped before buffering so one oversized crawl
/// response cannot bloat memory or the store file.
const MAX_PAYLOAD_BYTES: usize = 50 * 1024;

pub struct LogSink {
    inner: Arc<SinkInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

struct SinkInner {
    store: Arc<KeyStore>,
    buffer: Mutex<VecDeque<NewLogEntry>>,
    flushing: AtomicBool,
    threshold: usize,
}

impl LogSink {
    /// Create the sink and start its periodic flush timer.
    pub fn new(store: Arc<KeyStore>, threshold: usize, interval: Duration) -> Arc<Self> {
        let inner = Arc::new(SinkInner {
            store,
            buffer: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            threshold,
        });
        let timer_inner = inner.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                timer_inner.flush().await;
            }
        });
        Arc::new(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Buffer one entry, flushing immediately once the threshold is hit.
    pub async fn enqueue(&self, mut entry: NewLogEntry) {
        entry.request_params = entry.request_params.map(truncate_payload);
        entry.response_data = entry.response_data.map(truncate_payload);
        entry.error_message = entry.error_message.map(truncate_payload);
        let len = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push_back(entry);
            buffer.len()
        };
        if len >= self.inner.threshold {
            self.inner.flush().await;
        }
    }

    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop the timer and write whatever is still buffered.
    pub async fn shutdown(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
        }
        self.inner.flush().await;
    }
}

impl SinkInner {
    /// Non-reentrant: a flush already in progress makes this a no-op, the
    /// in-progress write covers the batch.
    async fn flush(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        let batch: Vec<NewLogEntry> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if !batch.is_empty() {
            match self.store.append_logs(&batch).await {
                Ok(()) => debug!(entries = batch.len(), "audit log batch flushed"),
                Err(e) => {
                    warn!(error = %e, entries = batch.len(), "log flush failed, requeueing");
                    let mut buffer = self.buffer.lock().await;
                    for entry in batch.into_iter().rev() {
                        buffer.push_front(entry);
                    }
                }
            }
        }
        self.flushing.store(false, Ordering::SeqCst);
    }
}

fn truncate_payload(payload: String) -> String {
    if payload.len() <= MAX_PAYLOAD_BYTES {
        return payload;
    }
    let mut end = MAX_PAYLOAD_BYTES;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &payload[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::LogQuery;
    use tempfile::TempDir;

    fn entry(message: &str) -> NewLogEntry {
        NewLogEntry {
            key_id: Some(1),
            operation: "search".into(),
            request_params: Some(r#"{"query":"rust"}"#.into()),
            response_data: None,
            status: "error".into(),
            duration_ms: Some(12),
            error_type: Some("server".into()),
            error_message: Some(message.into()),
        }
    }

    async fn store_in(dir: &TempDir) -> Arc<KeyStore> {
        Arc::new(KeyStore::load(dir.path().join("keys.json")).await.unwrap())
    }

    async fn count_logs(store: &KeyStore) -> usize {
        store
            .query_logs(&LogQuery {
                page: 1,
                limit: 100,
                ..Default::default()
            })
            .await
            .total
    }

    #[tokio::test]
    async fn entries_stay_buffered_until_flush() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 200, Duration::from_secs(3600));
        sink.enqueue(entry("one")).await;
        sink.enqueue(entry("two")).await;
        assert_eq!(count_logs(&store).await, 0);
        sink.flush().await;
        assert_eq!(count_logs(&store).await, 2);
    }

    #[tokio::test]
    async fn threshold_triggers_immediate_flush() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 2, Duration::from_secs(3600));
        sink.enqueue(entry("one")).await;
        assert_eq!(count_logs(&store).await, 0);
        sink.enqueue(entry("two")).await;
        assert_eq!(count_logs(&store).await, 2);
    }

    #[tokio::test]
    async fn timer_flushes_without_explicit_call() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 200, Duration::from_millis(30));
        sink.enqueue(entry("timer")).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count_logs(&store).await, 1);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_entries() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 200, Duration::from_secs(3600));
        sink.enqueue(entry("last")).await;
        sink.shutdown().await;
        assert_eq!(count_logs(&store).await, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_flush_requeues_the_batch() {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 200, Duration::from_secs(3600));
        sink.enqueue(entry("kept")).await;

        // Make the store directory unwritable so the batch write fails
        std::fs::set_permissions(dir.path(), Permissions::from_mode(0o555)).unwrap();
        sink.flush().await;
        std::fs::set_permissions(dir.path(), Permissions::from_mode(0o755)).unwrap();

        sink.flush().await;
        assert_eq!(count_logs(&store).await, 1);
    }

    #[tokio::test]
    async fn oversized_payloads_are_truncated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        let sink = LogSink::new(store.clone(), 200, Duration::from_secs(3600));
        let mut big = entry("big");
        big.response_data = Some("x".repeat(200 * 1024));
        sink.enqueue(big).await;
        sink.flush().await;
        let page = store
            .query_logs(&LogQuery {
                page: 1,
                limit: 10,
                ..Default::default()
            })
            .await;
        let stored = page.logs[0].response_data.as_ref().unwrap();
        assert!(stored.len() <= MAX_PAYLOAD_BYTES + 20);
        assert!(stored.ends_with("...[truncated]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let payload = "é".repeat(MAX_PAYLOAD_BYTES);
        let truncated = truncate_payload(payload);
        assert!(truncated.ends_with("...[truncated]"));
    }
}
