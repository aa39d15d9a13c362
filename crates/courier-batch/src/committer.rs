//! Bulk SQL committer.
//!
//! Specializes the batcher for a parameterized bulk statement with two extra
//! invariants: no flush may carry the same row id twice (duplicates are held
//! back for the next flush), and a failed bulk statement degrades to
//! one-at-a-time writes under a per-row timeout, reporting rows that still
//! fail through the error callback instead of terminating.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::batcher::{BatchProcessor, Batcher};
use crate::BatchError;

/// Per-row write timeout in the degraded path.
const SINGLE_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer level (percent of capacity) above which producers are slowed.
const BACKPRESSURE_SOFT_PCT: usize = 90;
const BACKPRESSURE_SOFT_SLEEP: Duration = Duration::from_millis(100);
const BACKPRESSURE_HARD_SLEEP: Duration = Duration::from_millis(250);

pub trait Committable: Send + 'static {
    /// Id of the row this item updates, or `None` for inserts. Two items
    /// with the same row id must never appear in one bulk statement.
    fn row_id(&self) -> Option<String>;
}

#[async_trait]
pub trait BulkWriter<T>: Send + Sync {
    async fn write_batch(&self, batch: &[T]) -> Result<(), BatchError>;
    async fn write_one(&self, item: &T) -> Result<(), BatchError>;
}

pub type ErrorCallback<T> = Arc<dyn Fn(BatchError, T) + Send + Sync>;

pub struct Committer<T: Committable> {
    batcher: Batcher<T>,
    inner: Arc<CommitProcessor<T>>,
    label: String,
}

impl<T: Committable> Committer<T> {
    pub fn start(
        label: impl Into<String>,
        writer: Arc<dyn BulkWriter<T>>,
        timeout: Duration,
        capacity: usize,
        on_error: Option<ErrorCallback<T>>,
    ) -> Self {
        let label = label.into();
        let inner = Arc::new(CommitProcessor {
            label: label.clone(),
            writer,
            carryover: Mutex::new(Vec::new()),
            on_error,
        });
        let batcher = Batcher::start(inner.clone(), timeout, capacity);
        Committer { batcher, inner, label }
    }

    /// Queues an item, applying backpressure when the buffer runs hot and
    /// blocking once it is full. Returns the free capacity remaining.
    pub async fn queue(&self, v: T) -> usize {
        let len = self.batcher.len();
        let capacity = self.batcher.capacity();

        if len >= capacity {
            warn!(
                committer = %self.label,
                buffered = len,
                capacity = capacity,
                "committer at capacity, blocking producer"
            );
            tokio::time::sleep(BACKPRESSURE_HARD_SLEEP).await;
        } else if len * 100 >= capacity * BACKPRESSURE_SOFT_PCT {
            tokio::time::sleep(BACKPRESSURE_SOFT_SLEEP).await;
        }

        self.batcher.queue(v).await
    }

    pub fn len(&self) -> usize {
        self.batcher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batcher.is_empty()
    }

    /// Stops the worker and flushes everything, including rows that were
    /// held back by intra-flush deduplication.
    pub async fn stop(&self) {
        self.batcher.stop().await;
        loop {
            if self.inner.carryover.lock().await.is_empty() {
                break;
            }
            self.inner.process(Vec::new()).await;
        }
    }
}

struct CommitProcessor<T: Committable> {
    label: String,
    writer: Arc<dyn BulkWriter<T>>,
    /// Duplicate-row items held over from the previous flush.
    carryover: Mutex<Vec<T>>,
    on_error: Option<ErrorCallback<T>>,
}

#[async_trait]
impl<T: Committable> BatchProcessor<T> for CommitProcessor<T> {
    async fn process(&self, batch: Vec<T>) {
        let mut items: Vec<T> = self.carryover.lock().await.drain(..).collect();
        items.extend(batch);
        if items.is_empty() {
            return;
        }

        // intra-flush dedup by row id; later duplicates wait for the next flush
        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
        let mut current = Vec::with_capacity(items.len());
        let mut held = Vec::new();
        for item in items {
            match item.row_id() {
                Some(ref id) if !seen.insert(id.clone()) => held.push(item),
                _ => current.push(item),
            }
        }
        if !held.is_empty() {
            debug!(
                committer = %self.label,
                held = held.len(),
                "duplicate row ids held for next flush"
            );
            self.carryover.lock().await.extend(held);
        }

        if let Err(e) = self.writer.write_batch(&current).await {
            warn!(
                committer = %self.label,
                batch_size = current.len(),
                error = %e,
                "bulk write failed, degrading to single writes"
            );
            self.write_degraded(current).await;
        }
    }
}

impl<T: Committable> CommitProcessor<T> {
    async fn write_degraded(&self, items: Vec<T>) {
        for item in items {
            let result =
                tokio::time::timeout(SINGLE_WRITE_TIMEOUT, self.writer.write_one(&item)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report(e, item),
                Err(_) => self.report(BatchError::Timeout, item),
            }
        }
    }

    fn report(&self, error: BatchError, item: T) {
        match &self.on_error {
            Some(callback) => callback(error, item),
            None => warn!(
                committer = %self.label,
                error = %error,
                "single write failed and no error callback is registered"
            ),
        }
    }
}
