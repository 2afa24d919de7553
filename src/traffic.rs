//! Traffic-Log Buffer & Heartbeat (spec.md §4.D).
//!
//! The buffer's flush-on-time-or-size policy and background flush thread
//! are grounded in `router-api/src/module/fs_watch/db_pool.rs`'s
//! `LogDbPool` (`add_log` / `start_periodic_flush`), adapted from
//! `std::thread` + `Arc<RwLock<VecDeque<_>>>` to a Tokio task over a
//! `tokio::sync::Mutex<VecDeque<_>>`, and from its println!-based
//! logging to `log::warn!`/`log::info!`. The heartbeat's
//! `active`/`total` atomic counters and upsert-then-offline-on-shutdown
//! sequencing are grounded in
//! `examples/original_source/internal/heartbeat/heartbeat.go`'s
//! `HeartbeatService`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::store::{HeartbeatRow, Store, TrafficRecord};

/// Live connection counters, shared between the accept loop, session
/// teardown, and the heartbeat publisher.
#[derive(Default)]
pub struct ConnectionCounters {
    active: AtomicU32,
    total: AtomicU64,
}

impl ConnectionCounters {
    pub fn on_session_start(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_session_end(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Bounded, non-blocking-enqueue traffic-record buffer with a
/// time-or-size flush trigger.
pub struct TrafficBuffer {
    queue: Mutex<VecDeque<TrafficRecord>>,
    batch_size: usize,
    store: Store,
    flush_requested: Notify,
}

impl TrafficBuffer {
    pub fn new(store: Store, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            batch_size,
            store,
            flush_requested: Notify::new(),
        })
    }

    /// Enqueue a record. Never awaits I/O: this only ever takes the
    /// queue's mutex to push. Crossing `batch_size` merely wakes the
    /// background flusher early (spec.md §4.D/§5: "producers use
    /// non-blocking enqueue; consumer drains in batches") — the actual
    /// bulk insert only ever runs on `run_periodic_flush`'s task.
    pub async fn enqueue(&self, record: TrafficRecord) {
        let over_threshold = {
            let mut queue = self.queue.lock().await;
            queue.push_back(record);
            queue.len() >= self.batch_size
        };
        if over_threshold {
            self.flush_requested.notify_one();
        }
    }

    /// Drain whatever is currently queued and flush it, ignoring
    /// `batch_size` — used by the interval-driven flusher and by
    /// graceful shutdown's final drain.
    pub async fn flush_now(&self) {
        let batch = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect::<Vec<_>>()
        };
        if !batch.is_empty() {
            self.flush_batch(batch).await;
        }
    }

    async fn flush_batch(&self, batch: Vec<TrafficRecord>) {
        let len = batch.len();
        if let Err(e) = self.store.insert_traffic_batch(batch).await {
            log::warn!("traffic-log flush of {len} records failed, batch dropped: {e}");
        }
    }

    /// Periodic flush loop; run as its own task until `cancel` fires.
    /// Wakes early on a size-triggered `flush_requested` notification
    /// rather than waiting for the next timer tick.
    pub async fn run_periodic_flush(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.flush_now().await,
                _ = self.flush_requested.notified() => self.flush_now().await,
                _ = cancel.cancelled() => {
                    self.flush_now().await;
                    return;
                }
            }
        }
    }
}

/// Periodic heartbeat publisher, keyed by `proxy_id = hostname:port`.
pub struct Heartbeat {
    proxy_id: String,
    proxy_host: String,
    proxy_port: u16,
    counters: Arc<ConnectionCounters>,
    store: Store,
}

impl Heartbeat {
    pub fn new(proxy_host: String, proxy_port: u16, counters: Arc<ConnectionCounters>, store: Store) -> Self {
        Self {
            proxy_id: format!("{proxy_host}:{proxy_port}"),
            proxy_host,
            proxy_port,
            counters,
            store,
        }
    }

    async fn upsert(&self, status: &'static str) {
        let row = HeartbeatRow {
            proxy_id: self.proxy_id.clone(),
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
            status,
            active_conns: self.counters.active(),
            total_conns: self.counters.total(),
            last_heartbeat: Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.store.upsert_heartbeat(row).await {
            log::warn!("heartbeat upsert failed: {e}");
        }
    }

    /// Run the heartbeat loop: one immediate upsert, then one per
    /// `interval` until cancelled, then a final `offline` upsert
    /// (spec.md §4.D: "on orderly shutdown one final upsert writes
    /// status = offline").
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        self.upsert("online").await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.upsert("online").await,
                _ = cancel.cancelled() => {
                    self.upsert("offline").await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u64) -> TrafficRecord {
        TrafficRecord {
            user_id: "u1".into(),
            client_endpoint: "127.0.0.1:1".into(),
            target_host: "example.com".into(),
            target_port: 443,
            bytes_sent: n,
            bytes_recv: 0,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn enqueue_never_flushes_inline_even_past_batch_size() {
        let store = Store::open_memory();
        let buffer = TrafficBuffer::new(store.clone(), 3);
        buffer.enqueue(record(1)).await;
        buffer.enqueue(record(2)).await;
        buffer.enqueue(record(3)).await;
        // crossing batch_size only wakes the background flusher; the
        // producer's own enqueue call never performs the DB write.
        assert_eq!(buffer.queue.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn crossing_batch_size_wakes_the_periodic_flusher() {
        let store = Store::open_memory();
        let buffer = TrafficBuffer::new(store.clone(), 3);
        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(buffer.clone().run_periodic_flush(Duration::from_secs(3600), cancel.clone()));

        buffer.enqueue(record(1)).await;
        buffer.enqueue(record(2)).await;
        buffer.enqueue(record(3)).await;

        // Give the notified flusher a chance to run without relying on
        // the hour-long timer tick.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.queue.lock().await.len(), 0);

        cancel.cancel();
        let _ = flusher.await;
    }

    #[tokio::test]
    async fn flush_now_drains_partial_batch() {
        let store = Store::open_memory();
        let buffer = TrafficBuffer::new(store, 1000);
        buffer.enqueue(record(1)).await;
        buffer.flush_now().await;
        assert_eq!(buffer.queue.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn heartbeat_run_writes_offline_row_on_cancellation() {
        let store = Store::open_memory();
        let counters = Arc::new(ConnectionCounters::default());
        counters.on_session_start();
        let heartbeat = Heartbeat::new("host".into(), 1080, counters, store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        heartbeat.run(Duration::from_secs(60), cancel).await;

        let status: String = {
            let conn = store.connection_for_test();
            conn.query_row("SELECT status FROM proxy_heartbeats WHERE proxy_id = 'host:1080'", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(status, "offline");
    }

    #[test]
    fn counters_track_active_and_total() {
        let counters = ConnectionCounters::default();
        counters.on_session_start();
        counters.on_session_start();
        counters.on_session_end();
        assert_eq!(counters.active(), 1);
        assert_eq!(counters.total(), 2);
    }
}
