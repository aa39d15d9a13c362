//! Generic scoped background batcher.
//!
//! One background task per batcher. Producers call [`Batcher::queue`], which
//! blocks when the buffer is full; the worker wakes every `timeout`, drains
//! the whole buffer and calls the processor exactly once with that slice.
//! On stop the worker drains whatever is left, processes it and exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process(&self, batch: Vec<T>);
}

pub struct Batcher<T> {
    tx: mpsc::Sender<T>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
    stop_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates the batcher and spawns its background worker.
    pub fn start(processor: Arc<dyn BatchProcessor<T>>, timeout: Duration, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        let worker_buffered = buffered.clone();
        let handle = tokio::spawn(async move {
            run_worker(rx, stop_rx, processor, timeout, worker_buffered).await;
        });

        Batcher {
            tx,
            buffered,
            capacity,
            stop_tx: parking_lot::Mutex::new(Some(stop_tx)),
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Queues a value, blocking while the buffer is full. Returns the free
    /// capacity remaining after the enqueue.
    pub async fn queue(&self, v: T) -> usize {
        self.buffered.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(v).await.is_err() {
            self.buffered.fetch_sub(1, Ordering::SeqCst);
            warn!("batcher queue called after stop, value dropped");
        }
        self.capacity.saturating_sub(self.buffered.load(Ordering::SeqCst))
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops the worker, flushing everything still buffered.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "batcher worker terminated abnormally");
            }
        }
    }
}

async fn run_worker<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    mut stop_rx: oneshot::Receiver<()>,
    processor: Arc<dyn BatchProcessor<T>>,
    timeout: Duration,
    buffered: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                let batch = drain(&mut rx, &buffered);
                if !batch.is_empty() {
                    process_batch(&processor, batch).await;
                }
            }
            _ = &mut stop_rx => {
                let batch = drain(&mut rx, &buffered);
                if !batch.is_empty() {
                    process_batch(&processor, batch).await;
                }
                debug!("batcher worker stopped");
                break;
            }
        }
    }
}

fn drain<T>(rx: &mut mpsc::Receiver<T>, buffered: &AtomicUsize) -> Vec<T> {
    let mut batch = Vec::new();
    while let Ok(v) = rx.try_recv() {
        batch.push(v);
    }
    if !batch.is_empty() {
        buffered.fetch_sub(batch.len(), Ordering::SeqCst);
    }
    batch
}

/// A processor failure must never kill the worker.
async fn process_batch<T>(processor: &Arc<dyn BatchProcessor<T>>, batch: Vec<T>) {
    let size = batch.len();
    let result = std::panic::AssertUnwindSafe(processor.process(batch))
        .catch_unwind()
        .await;
    if result.is_err() {
        error!(batch_size = size, "batch processor panicked, batch lost");
    }
}
