//! Bounded async worker pool.
//!
//! Tasks are `Result`-returning futures. The pool is the catch-and-log
//! boundary for everything submitted to it: an `Err` or a panic inside a task
//! is logged with the pool name and ends only that task.

use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::Error;
use crate::InformerError;
use crate::Result;

pub type Task = BoxFuture<'static, Result<()>>;

/// What `submit` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Return `QueueFull` to the submitter
    Reject,
    /// Drop the task silently
    Ignore,
}

pub struct WorkerPool {
    name: String,
    overflow: OverflowPolicy,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl Debug for WorkerPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("overflow", &self.overflow)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `workers` tasks on the current runtime sharing one queue of
    /// `queue_size` slots.
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        queue_size: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Task>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let completed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let name = name.clone();
                let completed = completed.clone();
                let failed = failed.clone();
                tokio::spawn(async move {
                    loop {
                        let task = { rx.lock().await.recv().await };
                        let Some(task) = task else {
                            break;
                        };
                        match AssertUnwindSafe(task).catch_unwind().await {
                            Ok(Ok(())) => {
                                completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(e)) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                warn!(pool = %name, worker_id, error = %e, "task failed");
                            }
                            Err(panic) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                error!(pool = %name, worker_id, "task panicked: {}", panic_message(&panic));
                            }
                        }
                    }
                    debug!(pool = %name, worker_id, "worker exited");
                })
            })
            .collect();

        Self {
            name,
            overflow,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            completed,
            failed,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a task without waiting.
    ///
    /// With [`OverflowPolicy::Ignore`] a full queue drops the task and returns
    /// `Ok(())`; with [`OverflowPolicy::Reject`] it returns `QueueFull`.
    pub fn submit(
        &self,
        task: Task,
    ) -> Result<()> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(Error::PoolStopped(self.name.clone()));
        };

        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.overflow {
                    OverflowPolicy::Ignore => {
                        debug!(pool = %self.name, "queue full, task ignored");
                        Ok(())
                    }
                    OverflowPolicy::Reject => {
                        warn!(pool = %self.name, "queue full, task rejected");
                        Err(InformerError::QueueFull(self.name.clone()).into())
                    }
                }
            }
            Err(TrySendError::Closed(_)) => Err(Error::PoolStopped(self.name.clone())),
        }
    }

    /// Number of tasks that finished with `Ok`
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Number of tasks that returned an error or panicked
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Number of tasks refused because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits for the workers to finish what is queued.
    pub async fn stop(&self) {
        if self.tx.lock().take().is_none() {
            return;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = %self.name, "worker join failed: {:?}", e);
            }
        }
        debug!(pool = %self.name, "stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.lock().iter() {
            handle.abort();
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
