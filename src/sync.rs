use crate::config::ProducerTarget;
use crate::record::{dedup_by_timestamp, max_timestamp};
use crate::store::RecordStore;
use crate::transmit::{RequestPayload, Transmitter};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Counters shared between the sync loop, the pinger and the status endpoint.
#[derive(Debug, Default)]
pub struct SyncStats {
    last_record_timestamp: AtomicI64,
    last_sync_unix: AtomicI64,
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub last_record_timestamp: i64,
    pub last_sync_unix: i64,
    pub batches_sent: u64,
    pub records_sent: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_record_timestamp(&self) -> i64 {
        self.last_record_timestamp.load(Ordering::Relaxed)
    }

    fn record_batch(&self, newest: i64, sent: usize) {
        self.last_record_timestamp.store(newest, Ordering::Relaxed);
        self.last_sync_unix.store(Utc::now().timestamp(), Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.records_sent.fetch_add(sent as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            last_record_timestamp: self.last_record_timestamp.load(Ordering::Relaxed),
            last_sync_unix: self.last_sync_unix.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
        }
    }
}

/// Where delivered ids go: straight to the store, or through a bounded queue
/// drained by a small worker pool.
#[derive(Clone)]
pub enum SyncMarker {
    Inline(RecordStore),
    Queued(mpsc::Sender<Vec<i64>>),
}

impl SyncMarker {
    pub async fn mark(&self, ids: Vec<i64>) -> Result<()> {
        match self {
            SyncMarker::Inline(store) => {
                store.mark_synced(&ids).await?;
            }
            SyncMarker::Queued(tx) => {
                tx.send(ids)
                    .await
                    .map_err(|_| anyhow!("sync marker workers stopped"))?;
            }
        }
        Ok(())
    }
}

/// Starts `workers` tasks sharing one bounded queue of id sets. A failed update
/// ends the worker with an error.
pub fn spawn_mark_workers(
    store: RecordStore,
    workers: usize,
    queue: usize,
) -> (SyncMarker, Vec<JoinHandle<Result<()>>>) {
    let (tx, rx) = mpsc::channel::<Vec<i64>>(queue.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..workers.max(1))
        .map(|worker| {
            let store = store.clone();
            let rx = rx.clone();
            tokio::spawn(run_mark_worker(worker, store, rx))
        })
        .collect();
    (SyncMarker::Queued(tx), handles)
}

async fn run_mark_worker(
    worker: usize,
    store: RecordStore,
    rx: Arc<Mutex<mpsc::Receiver<Vec<i64>>>>,
) -> Result<()> {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(ids) = next else {
            tracing::debug!(worker, "mark queue closed");
            return Ok(());
        };
        store
            .mark_synced(&ids)
            .await
            .with_context(|| format!("mark worker {worker} failed"))?;
    }
}

pub struct SyncLoop {
    store: RecordStore,
    transmitter: Transmitter,
    marker: SyncMarker,
    stats: Arc<SyncStats>,
    target: ProducerTarget,
    batch_size: usize,
}

impl SyncLoop {
    pub fn new(
        store: RecordStore,
        transmitter: Transmitter,
        marker: SyncMarker,
        stats: Arc<SyncStats>,
        target: ProducerTarget,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            transmitter,
            marker,
            stats,
            target,
            batch_size,
        }
    }

    /// Fetch, dedup, transmit and mark one batch. Returns how many records were
    /// fetched; zero means the buffer was empty.
    pub async fn sync_once(&self) -> Result<usize> {
        let records = self.store.fetch_unsynced(self.batch_size).await?;
        if records.is_empty() {
            return Ok(0);
        }
        debug_assert!(records.iter().all(|record| !record.synced));

        let data = dedup_by_timestamp(&records);
        if data.len() < records.len() {
            tracing::debug!(
                fetched = records.len(),
                kept = data.len(),
                "dropped records with duplicate timestamps"
            );
        }
        let payload = RequestPayload {
            timestamp: Utc::now().timestamp(),
            hostname: &self.target.hostname,
            data: &data,
        };
        self.transmitter
            .post(&self.target.api_endpoint, &payload)
            .await
            .context("failed to write batch to API")?;
        tracing::info!(count = data.len(), "synced records to API");

        if let Some(newest) = max_timestamp(&records) {
            self.stats.record_batch(newest, data.len());
        }

        // Duplicates are marked too, otherwise they would be fetched again forever.
        let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        self.marker.mark(ids).await?;
        Ok(records.len())
    }

    pub async fn run(self, poll_interval: Duration) -> Result<()> {
        tracing::info!(
            endpoint = %self.target.api_endpoint,
            batch_size = self.batch_size,
            "starting sync loop"
        );
        loop {
            if self.sync_once().await? == 0 {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{new_record, temp_store};
    use crate::transmit::tests::spawn_api;

    fn target(url: &str) -> ProducerTarget {
        ProducerTarget {
            api_endpoint: url.to_string(),
            hostname: "gateway-1".to_string(),
        }
    }

    fn sync_loop(store: &RecordStore, url: &str, batch_size: usize) -> (SyncLoop, Arc<SyncStats>) {
        let stats = Arc::new(SyncStats::new());
        let sync = SyncLoop::new(
            store.clone(),
            Transmitter::new(Duration::from_secs(5)).unwrap(),
            SyncMarker::Inline(store.clone()),
            stats.clone(),
            target(url),
            batch_size,
        );
        (sync, stats)
    }

    #[tokio::test]
    async fn empty_buffer_sends_nothing() {
        let (_dir, store) = temp_store().await;
        let (url, captures) = spawn_api(201).await;
        let (sync, stats) = sync_loop(&store, &url, 25);

        assert_eq!(sync.sync_once().await.unwrap(), 0);
        assert!(captures.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().batches_sent, 0);
    }

    #[tokio::test]
    async fn batch_is_deduplicated_sent_and_marked() {
        let (_dir, store) = temp_store().await;
        for (ts, payload) in [(10, "a"), (10, "dup"), (11, "b"), (12, "c")] {
            store.insert(&new_record(ts, payload)).await.unwrap();
        }
        let (url, captures) = spawn_api(201).await;
        let (sync, stats) = sync_loop(&store, &url, 25);

        assert_eq!(sync.sync_once().await.unwrap(), 4);

        let captured = captures.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        let body = &captured[0].body;
        assert_eq!(body["hostname"], "gateway-1");
        assert!(body["timestamp_utc_transmitted"].as_i64().unwrap() > 0);
        let sent: Vec<(i64, String)> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| {
                (
                    item["timestamp_utc_recorded"].as_i64().unwrap(),
                    item["payload"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            sent,
            vec![
                (10, "a".to_string()),
                (11, "b".to_string()),
                (12, "c".to_string())
            ]
        );

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.synced, 4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.last_record_timestamp, 12);
        assert_eq!(snapshot.batches_sent, 1);
        assert_eq!(snapshot.records_sent, 3);
    }

    #[tokio::test]
    async fn batches_never_exceed_batch_size() {
        let (_dir, store) = temp_store().await;
        for ts in 0..7 {
            store.insert(&new_record(ts, "x")).await.unwrap();
        }
        let (url, captures) = spawn_api(201).await;
        let (sync, _stats) = sync_loop(&store, &url, 3);

        assert_eq!(sync.sync_once().await.unwrap(), 3);
        assert_eq!(sync.sync_once().await.unwrap(), 3);
        assert_eq!(sync.sync_once().await.unwrap(), 1);
        assert_eq!(sync.sync_once().await.unwrap(), 0);

        let captured = captures.lock().unwrap().clone();
        let sizes: Vec<usize> = captured
            .iter()
            .map(|c| c.body["data"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let first: Vec<i64> = captured[0].body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["timestamp_utc_recorded"].as_i64().unwrap())
            .collect();
        assert_eq!(first, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn non_201_fails_and_leaves_records_unsynced() {
        let (_dir, store) = temp_store().await;
        store.insert(&new_record(1, "a")).await.unwrap();
        let (url, _captures) = spawn_api(500).await;
        let (sync, stats) = sync_loop(&store, &url, 25);

        let err = sync.sync_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("500"));
        assert_eq!(store.counts().await.unwrap().pending, 1);
        assert_eq!(stats.last_record_timestamp(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_first_transmit_failure() {
        let (_dir, store) = temp_store().await;
        store.insert(&new_record(1, "a")).await.unwrap();
        let (url, _captures) = spawn_api(400).await;
        let (sync, _stats) = sync_loop(&store, &url, 25);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            sync.run(Duration::from_millis(10)),
        )
        .await
        .expect("sync loop should exit");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn queued_marker_workers_mark_records() {
        let (_dir, store) = temp_store().await;
        let a = store.insert(&new_record(1, "a")).await.unwrap();
        let b = store.insert(&new_record(2, "b")).await.unwrap();

        let (marker, handles) = spawn_mark_workers(store.clone(), 2, 4);
        marker.mark(vec![a]).await.unwrap();
        marker.mark(vec![b]).await.unwrap();
        drop(marker);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.synced, 2);
    }
}
