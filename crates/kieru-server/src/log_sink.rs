//! Best-effort asynchronous writer for access log entries.
//!
//! Producers never block: entries go into a bounded in-memory queue and a
//! small pool of writer tasks appends them to the store. When the queue is
//! full the oldest entry is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::store::{AccessLogEntry, SecretStore};

pub const DEFAULT_LOG_QUEUE: usize = 4096;
pub const DEFAULT_LOG_WRITERS: usize = 2;

struct Inner {
    queue: Mutex<VecDeque<AccessLogEntry>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct AccessLogSink {
    inner: Arc<Inner>,
}

impl AccessLogSink {
    /// Create a sink without writers. Entries accumulate until
    /// [`spawn_writers`](Self::spawn_writers) is called.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a sink and start `writers` tasks draining it into `store`.
    pub fn start(store: Arc<dyn SecretStore>, capacity: usize, writers: usize) -> Self {
        let sink = Self::new(capacity);
        sink.spawn_writers(store, writers);
        sink
    }

    pub fn spawn_writers(&self, store: Arc<dyn SecretStore>, writers: usize) {
        for _ in 0..writers.max(1) {
            let inner = self.inner.clone();
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut queue = inner.queue.lock();
                        let entry = queue.pop_front();
                        if entry.is_some() {
                            inner.in_flight.fetch_add(1, Ordering::SeqCst);
                        }
                        entry
                    };
                    match next {
                        Some(entry) => {
                            write_entry(store.as_ref(), entry);
                            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => inner.notify.notified().await,
                    }
                }
            });
        }
    }

    /// Queue an entry. Never blocks and never fails.
    pub fn enqueue(&self, entry: AccessLogEntry) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                if let Some(old) = queue.pop_front() {
                    let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(secret_id = %old.secret_id, dropped, "access log queue full, dropped oldest entry");
                }
            }
            queue.push_back(entry);
        }
        self.inner.notify.notify_one();
    }

    /// Entries dropped on overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Wait until the queue is empty and no writer holds an entry.
    pub async fn wait_idle(&self) {
        loop {
            let idle = {
                let queue = self.inner.queue.lock();
                queue.is_empty() && self.inner.in_flight.load(Ordering::SeqCst) == 0
            };
            if idle {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

fn write_entry(store: &dyn SecretStore, entry: AccessLogEntry) {
    let secret_id = entry.secret_id.clone();
    if let Err(e) = store.append_access_log(entry) {
        warn!(secret_id = %secret_id, error = %e, "access log write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::test_support::{make_store, sample};
    use crate::store::ClientMeta;

    fn entry(secret_id: &str, at: i64) -> AccessLogEntry {
        AccessLogEntry::new(secret_id, at, &ClientMeta::new("127.0.0.1", None), true, None)
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let sink = AccessLogSink::new(3);
        for i in 0..5 {
            sink.enqueue(entry("S1", i));
        }
        assert_eq!(sink.pending(), 3);
        assert_eq!(sink.dropped(), 2);

        let kept: Vec<i64> = sink
            .inner
            .queue
            .lock()
            .iter()
            .map(|e| e.accessed_at)
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn writers_drain_into_store() {
        let (store, _dir) = make_store();
        let (meta, payload) = sample("S1", None, 1, i64::MAX, 0);
        store.create(&meta, &payload).unwrap();

        let sink = AccessLogSink::start(Arc::new(store.clone()), 16, 2);
        for i in 0..10 {
            sink.enqueue(entry("S1", i));
        }
        // Unknown secret: skipped by the store, not an error.
        sink.enqueue(entry("GHOST", 99));
        sink.wait_idle().await;

        assert_eq!(store.list_access_logs("S1", 0, 100).unwrap().len(), 10);
        assert_eq!(sink.dropped(), 0);
    }
}
