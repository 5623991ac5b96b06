//! Asynchronous hole punching.
//!
//! Producers hand `(layer, offset, len)` requests to a bounded queue without
//! waiting; a background task drains the queue and deallocates the ranges on
//! the blocking pool. A full queue drops the request and counts it: a missed
//! punch only costs space, never correctness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ReplicaError, ReplicaResult};
use crate::sparse::SparseFile;

/// A message for the hole punching task.
#[derive(Debug)]
pub enum HoleRequest {
    /// Deallocate `[offset, offset + len)` of `layer`.
    Punch {
        /// Layer to punch; never the live head.
        layer: Arc<dyn SparseFile>,
        /// Byte offset.
        offset: u64,
        /// Byte length.
        len: u64,
    },
    /// Acknowledged once every earlier request has been processed.
    Flush(oneshot::Sender<()>),
}

struct HoleStatsInner {
    enqueued: AtomicU64,
    punched: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl HoleStatsInner {
    fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            punched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

/// Counters of the hole punching queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolePunchStats {
    /// Requests accepted into the queue.
    pub enqueued: u64,
    /// Requests that deallocated their range.
    pub punched: u64,
    /// Requests dropped because the queue was full or closed.
    pub dropped: u64,
    /// Requests whose punch call failed.
    pub failed: u64,
}

/// Bounded queue plus the task that drains it.
pub struct HolePuncher {
    tx: mpsc::Sender<HoleRequest>,
    stats: Arc<HoleStatsInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HolePuncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePuncher")
            .field("stats", &self.stats())
            .finish()
    }
}

impl HolePuncher {
    /// Starts the drain task on the current tokio runtime.
    ///
    /// Fails with [`ReplicaError::Unsupported`] outside a runtime.
    pub fn start(capacity: usize) -> ReplicaResult<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ReplicaError::Unsupported(format!("hole punching needs a tokio runtime: {}", e)))?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(HoleStatsInner::new());
        let task = handle.spawn(drain(rx, stats.clone()));
        debug!(capacity, "hole puncher started");
        Ok(Self {
            tx,
            stats,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queues a punch without blocking. Returns false if it was dropped.
    pub fn enqueue(&self, layer: Arc<dyn SparseFile>, offset: u64, len: u64) -> bool {
        match self.tx.try_send(HoleRequest::Punch { layer, offset, len }) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(offset, len, "hole queue full, dropping punch");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Waits until every request queued before this call has been processed.
    pub async fn flush(&self) -> ReplicaResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(HoleRequest::Flush(ack_tx))
            .await
            .map_err(|_| ReplicaError::Unsupported("hole puncher stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| ReplicaError::Unsupported("hole puncher stopped".to_string()))
    }

    /// Current counters.
    pub fn stats(&self) -> HolePunchStats {
        HolePunchStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            punched: self.stats.punched.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the drain task; queued requests are discarded.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("hole puncher stopped");
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<HoleRequest>, stats: Arc<HoleStatsInner>) {
    while let Some(request) = rx.recv().await {
        match request {
            HoleRequest::Punch { layer, offset, len } => {
                let result = tokio::task::spawn_blocking(move || layer.punch_hole(offset, len)).await;
                match result {
                    Ok(Ok(())) => {
                        stats.punched.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(offset, len, error = %e, "punch hole failed");
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(offset, len, error = %e, "punch hole task failed");
                    }
                }
            }
            HoleRequest::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("hole queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::MemFile;

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = HolePuncher::start(4);
        assert!(matches!(result, Err(ReplicaError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_punch_and_flush() {
        let layer = Arc::new(MemFile::new(16, 4));
        layer.write_full_at(&[1u8; 16], 0).unwrap();
        let puncher = HolePuncher::start(8).unwrap();

        assert!(puncher.enqueue(layer.clone(), 4, 4));
        assert!(puncher.enqueue(layer.clone(), 12, 4));
        puncher.flush().await.unwrap();

        assert!(layer.has_data(0, 4).unwrap());
        assert!(!layer.has_data(4, 4).unwrap());
        assert!(!layer.has_data(12, 4).unwrap());
        let stats = puncher.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.punched, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let layer: Arc<dyn SparseFile> = Arc::new(MemFile::new(64, 4));
        let puncher = HolePuncher::start(1).unwrap();
        // The current-thread runtime cannot drain until we yield.
        let accepted = (0..4)
            .filter(|i| puncher.enqueue(layer.clone(), i * 4, 4))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(puncher.stats().dropped, 3);
        puncher.flush().await.unwrap();
        assert_eq!(puncher.stats().punched, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_new_requests() {
        let layer: Arc<dyn SparseFile> = Arc::new(MemFile::new(16, 4));
        let puncher = HolePuncher::start(4).unwrap();
        puncher.shutdown();
        tokio::task::yield_now().await;
        assert!(puncher.flush().await.is_err());
        assert!(!puncher.enqueue(layer, 0, 4));
    }
}
