//! Fixed-size worker pool with a bounded queue.
//!
//! Submission never waits: when the queue is full the task is handed back
//! through [`Task::reject`] so it can answer its caller with an overload
//! error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a task was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    QueueFull,
    ShuttingDown,
}

/// A unit of work for the pool.
pub trait Task: Send + 'static {
    fn name(&self) -> &'static str;

    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Called instead of `run` when the pool does not accept the task.
    fn reject(self: Box<Self>, reason: Rejection);
}

struct Tracked {
    inner: Box<dyn Task>,
    done: oneshot::Sender<()>,
}

impl Task for Tracked {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Tracked { inner, done } = *self;
        Box::pin(async move {
            inner.run().await;
            let _ = done.send(());
        })
    }

    fn reject(self: Box<Self>, reason: Rejection) {
        self.inner.reject(reason);
    }
}

type Queue = Arc<Mutex<mpsc::Receiver<Box<dyn Task>>>>;

pub struct WorkerPool {
    sender: ArcSwapOption<mpsc::Sender<Box<dyn Task>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawns `num_workers` workers sharing a queue of `capacity` slots.
    #[must_use]
    pub fn new(num_workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue: Queue = Arc::new(Mutex::new(rx));
        let workers = (0..num_workers.max(1))
            .map(|index| tokio::spawn(worker_loop(index, Arc::clone(&queue))))
            .collect();
        info!(workers = num_workers.max(1), capacity, "Worker pool started");
        Self {
            sender: ArcSwapOption::from_pointee(tx),
            workers: parking_lot::Mutex::new(workers),
            capacity,
        }
    }

    /// Queues `task` without waiting. Returns `false` if it was rejected,
    /// in which case [`Task::reject`] has already been called.
    pub fn try_submit(&self, task: Box<dyn Task>) -> bool {
        let guard = self.sender.load();
        let Some(sender) = guard.as_ref() else {
            task.reject(Rejection::ShuttingDown);
            return false;
        };
        match sender.try_send(task) {
            Ok(()) => {
                self.record_queue_size(sender);
                true
            }
            Err(TrySendError::Full(task)) => {
                metrics::counter!("cfgsync_overload_rejections_total").increment(1);
                warn!(task = task.name(), capacity = self.capacity, "Request queue full");
                task.reject(Rejection::QueueFull);
                false
            }
            Err(TrySendError::Closed(task)) => {
                task.reject(Rejection::ShuttingDown);
                false
            }
        }
    }

    /// Like [`try_submit`](Self::try_submit), returning a receiver that
    /// resolves once the task has run. `None` if the task was rejected.
    pub fn submit_tracked(&self, task: Box<dyn Task>) -> Option<oneshot::Receiver<()>> {
        let (done, finished) = oneshot::channel();
        self.try_submit(Box::new(Tracked { inner: task, done }))
            .then_some(finished)
    }

    /// Tasks waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender
            .load()
            .as_ref()
            .map_or(0, |sender| sender.max_capacity() - sender.capacity())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops accepting tasks, lets the workers finish what is queued and
    /// waits up to `grace` for them. Workers still busy after that are
    /// aborted. Returns whether everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.sender.store(None);
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return true;
        }
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(workers)).await.is_ok() {
            info!("Worker pool drained");
            true
        } else {
            warn!(?grace, "Worker pool did not drain in time, aborting workers");
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_queue_size(&self, sender: &mpsc::Sender<Box<dyn Task>>) {
        let queued = sender.max_capacity() - sender.capacity();
        metrics::gauge!("cfgsync_rpc_queue_size").set(queued as f64);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(index: usize, queue: Queue) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(task) = next else { break };
        let name = task.name();
        if AssertUnwindSafe(task.run()).catch_unwind().await.is_err() {
            error!(worker = index, task = name, "Task panicked");
        }
    }
    debug!(worker = index, "Worker stopped");
}
