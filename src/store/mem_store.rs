//! In-process emulation of the subset of etcd used by this crate.
//!
//! Semantics follow etcd where the coordination components depend on them:
//! - every mutation bumps a global revision
//! - prefix watches deliver events in revision order with the previous KV
//! - revoking or expiring a lease deletes its keys and emits Delete events
//! - locks are FIFO per name, owned by a lease, and released with it
//!
//! Leases expire on their own when nothing renews them for `ttl` seconds. Tests
//! that need a lost session without waiting use [`MemStore::expire_lease`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::trace;

use super::KeepAliveResponse;
use super::KeyValue;
use super::KvStore;
use super::LeaseGrant;
use super::RawEventKind;
use super::RawWatchEvent;
use crate::Result;
use crate::StoreError;

const REAPER_INTERVAL: Duration = Duration::from_millis(200);
const WATCH_CHANNEL_SIZE: usize = 1024;

struct MemLease {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
    /// Fired when the lease is revoked or expires; closes keepalive channels
    gone: CancellationToken,
}

struct MemWatcher {
    id: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<RawWatchEvent>,
}

struct LockWaiter {
    lease: i64,
    key: String,
}

#[derive(Default)]
struct MemState {
    revision: i64,
    next_lease: i64,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<i64, MemLease>,
    watchers: Vec<MemWatcher>,
    locks: HashMap<String, VecDeque<LockWaiter>>,
}

struct MemInner {
    state: Mutex<MemState>,
    lock_released: Notify,
    next_watcher: AtomicU64,
    reaper_started: AtomicBool,
}

/// Shared, cloneable in-memory [`KvStore`].
///
/// Clones share the same keyspace, so several clients built on clones of one
/// `MemStore` behave like several processes connected to one cluster.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemStore")
            .field("revision", &state.revision)
            .field("keys", &state.data.len())
            .field("leases", &state.leases.len())
            .finish()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemState {
    fn emit(
        &mut self,
        event: RawWatchEvent,
    ) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in self.watchers.iter() {
            if event.kv.key.starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }

    fn put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: i64,
    ) {
        self.revision += 1;
        let prev = self.data.get(key).cloned();
        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease {
                if let Some(l) = self.leases.get_mut(&prev.lease) {
                    l.keys.remove(key);
                }
            }
        }
        if lease != 0 {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.to_string());
            }
        }
        let kv = KeyValue {
            key: key.to_string(),
            value,
            lease,
            create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(self.revision),
            mod_revision: self.revision,
        };
        self.data.insert(key.to_string(), kv.clone());
        self.emit(RawWatchEvent {
            kind: RawEventKind::Put,
            kv,
            prev_kv: prev,
        });
    }

    fn delete(
        &mut self,
        key: &str,
    ) -> Option<KeyValue> {
        let prev = self.data.remove(key)?;
        self.revision += 1;
        if prev.lease != 0 {
            if let Some(l) = self.leases.get_mut(&prev.lease) {
                l.keys.remove(key);
            }
        }
        self.emit(RawWatchEvent {
            kind: RawEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                mod_revision: self.revision,
                ..Default::default()
            },
            prev_kv: Some(prev.clone()),
        });
        Some(prev)
    }

    /// Drops a lease together with its keys and queued lock requests.
    /// Returns true if the lease existed.
    fn drop_lease(
        &mut self,
        lease_id: i64,
    ) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        lease.gone.cancel();
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete(&key);
        }
        for queue in self.locks.values_mut() {
            queue.retain(|w| w.lease != lease_id);
        }
        self.locks.retain(|_, q| !q.is_empty());
        true
    }

    fn remove_waiter(
        &mut self,
        name: &str,
        lease_id: i64,
    ) {
        let mut key = None;
        if let Some(queue) = self.locks.get_mut(name) {
            if let Some(pos) = queue.iter().position(|w| w.lease == lease_id) {
                key = queue.remove(pos).map(|w| w.key);
            }
            if queue.is_empty() {
                self.locks.remove(name);
            }
        }
        if let Some(key) = key {
            self.delete(&key);
        }
    }
}

/// Removes a queued lock request when the waiting future is dropped before
/// it owns the lock.
struct WaiterGuard {
    inner: Arc<MemInner>,
    name: String,
    lease: i64,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().remove_waiter(&self.name, self.lease);
            self.inner.lock_released.notify_waiters();
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemInner {
                state: Mutex::new(MemState {
                    next_lease: 0x694d_0000_0000,
                    ..Default::default()
                }),
                lock_released: Notify::new(),
                next_watcher: AtomicU64::new(1),
                reaper_started: AtomicBool::new(false),
            }),
        }
    }

    /// Expires a lease immediately, as if its TTL elapsed without renewal.
    ///
    /// Keys bound to the lease are deleted (emitting Delete events), its
    /// keepalive channels are closed and its lock requests are dropped.
    /// Returns false if the lease did not exist.
    pub fn expire_lease(
        &self,
        lease_id: i64,
    ) -> bool {
        let existed = self.inner.state.lock().drop_lease(lease_id);
        if existed {
            debug!("mem store expired lease {:x}", lease_id);
            self.inner.lock_released.notify_waiters();
        }
        existed
    }

    /// Current revision of the keyspace
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Number of live watch streams
    pub fn watcher_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<MemInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(REAPER_INTERVAL).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut expired = false;
                {
                    let mut state = inner.state.lock();
                    let due: Vec<i64> = state
                        .leases
                        .iter()
                        .filter(|(_, l)| l.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in due {
                        trace!("mem store lease {:x} reached its ttl", id);
                        expired |= state.drop_lease(id);
                    }
                }
                if expired {
                    inner.lock_released.notify_waiters();
                }
            }
        });
    }
}

#[async_trait]
impl KvStore for MemStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseGrant> {
        self.ensure_reaper();
        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            MemLease {
                ttl,
                deadline: Instant::now() + Duration::from_secs(ttl.max(1) as u64),
                keys: HashSet::new(),
                gone: CancellationToken::new(),
            },
        );
        Ok(LeaseGrant { id, ttl })
    }

    async fn revoke(
        &self,
        lease_id: i64,
    ) -> Result<()> {
        if !self.expire_lease(lease_id) {
            return Err(StoreError::LeaseNotFound(lease_id).into());
        }
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>> {
        let (ttl, gone) = {
            let state = self.inner.state.lock();
            let lease = state.leases.get(&lease_id).ok_or(StoreError::LeaseNotFound(lease_id))?;
            (lease.ttl, lease.gone.clone())
        };
        let (tx, rx) = mpsc::channel(16);
        let interval = Duration::from_millis((ttl.max(1) as u64 * 1000) / 3);
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let mut state = inner.state.lock();
                    let Some(lease) = state.leases.get_mut(&lease_id) else {
                        break;
                    };
                    lease.deadline = Instant::now() + Duration::from_secs(ttl.max(1) as u64);
                }
                // a full channel means nobody drains it; the renewal above still counts
                let _ = tx.try_send(KeepAliveResponse { id: lease_id, ttl });
                tokio::select! {
                    _ = gone.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = sleep(interval) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        let lease = lease.unwrap_or(0);
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease).into());
        }
        state.put(key, value, lease);
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>> {
        Ok(self.inner.state.lock().data.get(key).cloned())
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>> {
        let state = self.inner.state.lock();
        let mut kvs: Vec<KeyValue> = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        kvs.reverse();
        Ok(kvs)
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<Vec<KeyValue>> {
        let prev = self.inner.state.lock().delete(key);
        if prev.is_some() {
            // a deleted key might have been a lock ownership key
            self.inner.lock_released.notify_waiters();
        }
        Ok(prev.into_iter().collect())
    }

    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RawWatchEvent>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().watchers.push(MemWatcher {
            id,
            prefix: prefix.to_string(),
            tx: raw_tx,
        });
        trace!("mem store watcher {} registered on {}", id, prefix);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = raw_rx.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().watchers.retain(|w| w.id != id);
            }
            trace!("mem store watcher {} closed", id);
        });

        Ok(rx)
    }

    async fn lock(
        &self,
        name: &str,
        lease_id: i64,
    ) -> Result<String> {
        let key = format!("{}/{:x}", name, lease_id);
        {
            let mut state = self.inner.state.lock();
            if !state.leases.contains_key(&lease_id) {
                return Err(StoreError::LeaseNotFound(lease_id).into());
            }
            let already_queued = state
                .locks
                .get(name)
                .map(|q| q.iter().any(|w| w.lease == lease_id))
                .unwrap_or(false);
            if !already_queued {
                state.put(&key, Vec::new(), lease_id);
                state.locks.entry(name.to_string()).or_default().push_back(LockWaiter {
                    lease: lease_id,
                    key: key.clone(),
                });
            }
        }

        let mut guard = WaiterGuard {
            inner: self.inner.clone(),
            name: name.to_string(),
            lease: lease_id,
            armed: true,
        };

        loop {
            let released = self.inner.lock_released.notified();
            {
                let state = self.inner.state.lock();
                if !state.leases.contains_key(&lease_id) {
                    guard.armed = false;
                    return Err(StoreError::LeaseNotFound(lease_id).into());
                }
                let owner = state.locks.get(name).and_then(|q| q.front()).map(|w| w.lease);
                if owner == Some(lease_id) {
                    guard.armed = false;
                    return Ok(key);
                }
            }
            released.await;
        }
    }

    async fn unlock(
        &self,
        key: &str,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let found = state
                .locks
                .iter()
                .find_map(|(name, q)| q.iter().find(|w| w.key == key).map(|w| (name.clone(), w.lease)));
            match found {
                Some((name, lease)) => state.remove_waiter(&name, lease),
                None => {
                    state.delete(key);
                }
            }
        }
        self.inner.lock_released.notify_waiters();
        Ok(())
    }
}
