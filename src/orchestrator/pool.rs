//! Fixed-size worker pool for run requests.
//!
//! `size` long-lived workers pull jobs from one shared queue, so at most
//! `size` jobs ever execute at the same time. Shutting the pool down stops
//! workers from taking queued jobs; a job that already started is never
//! interrupted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Idempotent shutdown signal shared by the pool and its completion path.
#[derive(Debug, Default)]
pub struct PoolShutdown {
    token: CancellationToken,
    requested: AtomicBool,
    requests: AtomicUsize,
}

impl PoolShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Returns `true` only for the call that actually
    /// initiated it; later calls are no-ops.
    pub fn shutdown(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Number of times shutdown was requested, including no-op repeats.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown was requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// A pool of workers executing `job` for every submitted item.
pub struct WorkerPool<T> {
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<T>>>,
    tracker: TaskTracker,
    shutdown: Arc<PoolShutdown>,
    size: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `size` workers (at least one) on the current runtime.
    pub fn spawn<F, Fut>(size: usize, shutdown: Arc<PoolShutdown>, job: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<T>();
        let receiver = Arc::new(Mutex::new(receiver));
        let job = Arc::new(job);
        let tracker = TaskTracker::new();

        for worker in 0..size {
            let receiver = Arc::clone(&receiver);
            let shutdown = Arc::clone(&shutdown);
            let job = Arc::clone(&job);

            tracker.spawn(async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        item = async { receiver.lock().await.recv().await } => item,
                    };
                    let Some(item) = next else {
                        break;
                    };
                    job(item).await;
                }
                debug!("Worker {} stopped", worker);
            });
        }
        tracker.close();

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            tracker,
            shutdown,
            size,
        }
    }

    /// Queues an item. Returns `false` if the pool no longer accepts work.
    pub fn submit(&self, item: T) -> bool {
        if self.shutdown.is_shutdown() {
            return false;
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    /// Stops accepting new items. Workers exit once the queue is drained.
    pub fn close_queue(&self) {
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// Waits up to `timeout` for every worker to exit.
    ///
    /// Returns `true` if the pool terminated within the timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
