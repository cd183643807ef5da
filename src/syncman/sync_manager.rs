use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::SyncClient;
use crate::Error;
use crate::OverflowPolicy;
use crate::ResourceEventHandler;
use crate::Result;
use crate::SyncConfig;
use crate::WorkerPool;

/// One scheduled resync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTask {
    pub is_first: bool,
    pub is_timeout: bool,
}

struct SyncInner {
    client: Arc<dyn SyncClient>,
    name: String,
    /// Set while a resync is queued and not yet started
    scheduled: AtomicBool,
    worker: WorkerPool,
    timer: Mutex<Option<JoinHandle<()>>>,
    min_interval: Duration,
    runs: AtomicU64,
    stopped: AtomicBool,
}

/// Debounces resync requests for one [`SyncClient`].
///
/// `sync_once` requests arriving while one is already scheduled are dropped:
/// the scheduled run recomputes everything from scratch, so it covers them.
/// The dedicated worker runs one resync at a time with room for one more.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("name", &self.inner.name)
            .field("scheduled", &self.inner.scheduled.load(Ordering::Relaxed))
            .field("runs", &self.runs())
            .finish()
    }
}

impl SyncManager {
    /// Must be called within a tokio runtime; spawns the sync worker.
    pub fn new(
        client: Arc<dyn SyncClient>,
        config: &SyncConfig,
    ) -> Self {
        let name = client.name();
        let worker = WorkerPool::new(format!("sync-{}", name), 1, 1, OverflowPolicy::Ignore);
        Self {
            inner: Arc::new(SyncInner {
                client,
                name,
                scheduled: AtomicBool::new(false),
                worker,
                timer: Mutex::new(None),
                min_interval: config.min_interval(),
                runs: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of completed `do_sync` calls
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Runs the first resync inline, then arms the timer.
    pub async fn first_sync(&self) -> Result<()> {
        info!("{}: first sync", self.inner.name);
        execute(
            &self.inner,
            SyncTask {
                is_first: true,
                is_timeout: false,
            },
        )
        .await
    }

    /// Schedules a resync unless one is already scheduled.
    pub fn sync_once(
        &self,
        is_first: bool,
        is_timeout: bool,
    ) {
        schedule(&self.inner, SyncTask { is_first, is_timeout });
    }

    /// Cancels the timer and waits for the worker to finish.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        self.inner.worker.stop().await;
        info!("{}: sync manager stopped", self.inner.name);
    }
}

fn schedule(
    inner: &Arc<SyncInner>,
    task: SyncTask,
) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    if inner
        .scheduled
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        trace!("{}: resync already scheduled, drop {:?}", inner.name, task);
        return;
    }

    let weak = Arc::downgrade(inner);
    let run = async move {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        // from here on a new request may queue behind this run
        inner.scheduled.store(false, Ordering::SeqCst);
        execute(&inner, task).await
    };
    if let Err(e) = inner.worker.submit(run.boxed()) {
        inner.scheduled.store(false, Ordering::SeqCst);
        warn!("{}: schedule resync: {}", inner.name, e);
    }
}

async fn execute(
    inner: &Arc<SyncInner>,
    task: SyncTask,
) -> Result<()> {
    debug!("{}: do_sync {:?}", inner.name, task);
    // a panic counts as a failed run
    let result = match AssertUnwindSafe(inner.client.do_sync(task.is_first, task.is_timeout))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Fatal(format!("{}: do_sync panicked", inner.name))),
    };
    inner.runs.fetch_add(1, Ordering::SeqCst);

    let (next, result) = match result {
        Ok(interval) => (interval.max(inner.min_interval), Ok(())),
        Err(e) => {
            warn!("{}: resync failed: {}", inner.name, e);
            (inner.min_interval, Err(e))
        }
    };
    arm_timer(inner, next);
    result
}

fn arm_timer(
    inner: &Arc<SyncInner>,
    interval: Duration,
) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    let weak: Weak<SyncInner> = Arc::downgrade(inner);
    let handle = tokio::spawn(async move {
        sleep(interval).await;
        if let Some(inner) = weak.upgrade() {
            schedule(&inner, SyncTask {
                is_first: false,
                is_timeout: true,
            });
        }
    });
    if let Some(previous) = inner.timer.lock().replace(handle) {
        previous.abort();
    }
    trace!("{}: next resync in {:?}", inner.name, interval);
}

impl ResourceEventHandler for SyncManager {
    fn on_add(
        &self,
        obj: &Value,
    ) {
        if self.inner.client.need_sync(obj) {
            self.sync_once(false, false);
        }
    }

    fn on_update(
        &self,
        _old_obj: &Value,
        new_obj: &Value,
    ) {
        if self.inner.client.need_sync(new_obj) {
            self.sync_once(false, false);
        }
    }

    fn on_delete(
        &self,
        obj: &Value,
    ) {
        if self.inner.client.need_sync(obj) {
            self.sync_once(false, false);
        }
    }
}
