//! Bounded, drop-on-full pipeline in front of the store.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::record::UsageRecord;
use crate::stats::{RequestStatistics, StatsSnapshot};
use crate::store::{UsageStore, UsageStoreResult};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

pub struct UsagePipeline {
    tx: Mutex<Option<mpsc::Sender<UsageRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    stats: Arc<RequestStatistics>,
}

impl UsagePipeline {
    /// Opens the store at `path`, replays persisted records into the
    /// statistics view, and starts the single writer task. Must complete
    /// before the server accepts traffic.
    pub async fn start(path: &str, capacity: usize) -> UsageStoreResult<Arc<Self>> {
        let store = UsageStore::open(path).await?;
        store.ensure_schema().await?;

        let stats = Arc::new(RequestStatistics::new());
        let records = store.load_all().await?;
        for record in &records {
            stats.record(record);
        }
        info!(replayed = records.len(), "usage statistics loaded from store");

        let (tx, mut rx) = mpsc::channel::<UsageRecord>(capacity.max(1));
        let writer = tokio::spawn(async move {
            // recv() keeps yielding buffered records after all senders are
            // gone, so dropping the sender drains the queue before exit.
            while let Some(record) = rx.recv().await {
                if let Err(err) = store.insert(&record).await {
                    warn!(error = %err, "failed to persist usage record");
                }
            }
            if let Err(err) = store.close().await {
                warn!(error = %err, "failed to close usage store");
            }
        });

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            dropped: AtomicU64::new(0),
            stats,
        }))
    }

    /// Non-blocking. On a full queue the record is dropped from persistence
    /// (the in-memory view still sees it) and the drop counter increments.
    pub fn record(&self, record: UsageRecord) {
        self.stats.record(&record);

        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("usage queue full, record dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting records and waits for the writer to drain the queue
    /// and close the store.
    pub async fn shutdown(&self) {
        let tx = {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        drop(tx);

        let writer = {
            let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                warn!(error = %err, "usage writer task failed");
            }
        }
    }
}
