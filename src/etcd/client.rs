use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::Future;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::WatchEventHandler;
use super::WatchRegistry;
use crate::EtcdConfig;
use crate::EtcdStore;
use crate::KeepAliveResponse;
use crate::KeyValue;
use crate::KvStore;
use crate::Result;
use crate::StoreError;

const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Invoked by the keepalive task when the lease can no longer be renewed.
/// The default restarts the session.
pub type KeepaliveFailureCallback = Arc<dyn Fn(LeaseSessionClient) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked after every successful session restart.
pub type SessionRestartedHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The renewable lease owned by one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSession {
    pub lease_id: i64,
    pub ttl_secs: i64,
}

struct ClientInner {
    store: Arc<dyn KvStore>,
    namespace: String,
    request_timeout: Duration,
    lease_ttl: i64,

    session: ArcSwap<LeaseSession>,
    /// Receiver of the current session, picked up by the keepalive task
    keepalive_slot: Mutex<Option<mpsc::Receiver<KeepAliveResponse>>>,
    keepalive_ready: Arc<Notify>,
    restart_lock: tokio::sync::Mutex<()>,

    watchers: Arc<WatchRegistry>,
    on_keepalive_failure: Mutex<Option<KeepaliveFailureCallback>>,
    on_session_restarted: Mutex<Vec<SessionRestartedHook>>,

    shutdown: CancellationToken,
}

/// etcd client owning one renewable lease.
///
/// All keys are relative to the configured namespace. Every KV call is bounded
/// by the request timeout; errors go straight back to the caller.
#[derive(Clone)]
pub struct LeaseSessionClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for LeaseSessionClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaseSessionClient")
            .field("store", &self.inner.store.kind())
            .field("namespace", &self.inner.namespace)
            .field("session", &**self.inner.session.load())
            .field("watchers", &self.inner.watchers)
            .finish()
    }
}

impl LeaseSessionClient {
    /// Dials etcd and opens a session.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let store = EtcdStore::connect(config).await?;
        Self::new(Arc::new(store), config).await
    }

    /// Opens a session on an existing store: grants the lease, starts renewing
    /// it and spawns the keepalive task.
    pub async fn new(
        store: Arc<dyn KvStore>,
        config: &EtcdConfig,
    ) -> Result<Self> {
        let request_timeout = config.request_timeout();
        let lease_ttl = config.lease_ttl_secs;

        let grant = with_timeout("grant", request_timeout, store.grant(lease_ttl)).await?;
        let keepalive = with_timeout("keep_alive", request_timeout, store.keep_alive(grant.id)).await?;

        let inner = Arc::new(ClientInner {
            store,
            namespace: normalize_namespace(&config.namespace),
            request_timeout,
            lease_ttl,
            session: ArcSwap::from_pointee(LeaseSession {
                lease_id: grant.id,
                ttl_secs: grant.ttl,
            }),
            keepalive_slot: Mutex::new(Some(keepalive)),
            keepalive_ready: Arc::new(Notify::new()),
            restart_lock: tokio::sync::Mutex::new(()),
            watchers: Arc::new(WatchRegistry::default()),
            on_keepalive_failure: Mutex::new(None),
            on_session_restarted: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(keepalive_loop(Arc::downgrade(&inner)));
        info!(
            "lease session {:x} opened on {} store (ttl {}s)",
            grant.id,
            inner.store.kind(),
            grant.ttl
        );

        Ok(Self { inner })
    }

    /// Replaces the default keepalive failure handling (`restart_session`).
    pub fn set_on_keepalive_failure(
        &self,
        callback: KeepaliveFailureCallback,
    ) {
        *self.inner.on_keepalive_failure.lock() = Some(callback);
    }

    /// Registers a hook run after each successful `restart_session`.
    pub fn add_session_restarted_hook(
        &self,
        hook: SessionRestartedHook,
    ) {
        self.inner.on_session_restarted.lock().push(hook);
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn session(&self) -> LeaseSession {
        **self.inner.session.load()
    }

    pub fn lease_id(&self) -> i64 {
        self.session().lease_id
    }

    pub fn session_ttl(&self) -> i64 {
        self.session().ttl_secs
    }

    pub fn watchers(&self) -> &WatchRegistry {
        &self.inner.watchers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Grants a fresh lease and restarts keepalive on it, replacing the
    /// current session wholesale. Runs the restart hooks on success.
    ///
    /// Keys bound to the old lease keep that binding.
    pub async fn restart_session(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::SessionClosed.into());
        }
        {
            let _guard = self.inner.restart_lock.lock().await;
            let store = &self.inner.store;
            let timeout_dur = self.inner.request_timeout;

            let grant = with_timeout("grant", timeout_dur, store.grant(self.inner.lease_ttl)).await?;
            let keepalive = match with_timeout("keep_alive", timeout_dur, store.keep_alive(grant.id)).await {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = store.revoke(grant.id).await;
                    return Err(e);
                }
            };

            let old = self.inner.session.swap(Arc::new(LeaseSession {
                lease_id: grant.id,
                ttl_secs: grant.ttl,
            }));
            *self.inner.keepalive_slot.lock() = Some(keepalive);
            self.inner.keepalive_ready.notify_one();
            info!("lease session restarted: {:x} -> {:x}", old.lease_id, grant.id);
        }

        let hooks: Vec<SessionRestartedHook> = self.inner.on_session_restarted.lock().clone();
        for hook in hooks {
            hook().await;
        }
        Ok(())
    }

    /// Writes `value` at `key` without a lease.
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let key = self.full_key(key);
        self.call("put", self.inner.store.put(&key, value.into(), None)).await
    }

    /// Writes `value` bound to the current session lease.
    pub async fn put_session(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let key = self.full_key(key);
        let lease = self.lease_id();
        self.call("put_session", self.inner.store.put(&key, value.into(), Some(lease)))
            .await
    }

    /// Writes `value` bound to a new lease of `ttl_secs`, so that the key
    /// disappears once the TTL elapses.
    pub async fn put_with_lease(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl_secs: i64,
    ) -> Result<()> {
        let key = self.full_key(key);
        let grant = self.call("grant", self.inner.store.grant(ttl_secs)).await?;
        self.call("put_with_lease", self.inner.store.put(&key, value.into(), Some(grant.id)))
            .await
    }

    /// Reads one key; an absent key is `StoreError::NoSuchKey`.
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        let full = self.full_key(key);
        match self.call("get", self.inner.store.get(&full)).await? {
            Some(kv) => Ok(kv.value),
            None => Err(StoreError::NoSuchKey(key.to_string()).into()),
        }
    }

    /// Prefix scan, sorted descending by key, keys relative to the namespace.
    pub async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>> {
        let full = self.full_key(prefix);
        let kvs = self.call("list", self.inner.store.list(&full)).await?;
        Ok(kvs
            .into_iter()
            .map(|kv| KeyValue {
                key: self.strip_namespace(&kv.key),
                ..kv
            })
            .collect())
    }

    /// Deletes `key`; returns its previous value when exactly one key went away.
    pub async fn delete(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let full = self.full_key(key);
        let mut prev = self.call("delete", self.inner.store.delete(&full)).await?;
        if prev.len() == 1 {
            Ok(prev.pop().map(|kv| kv.value))
        } else {
            Ok(None)
        }
    }

    /// Subscribes `handler` to every key under `prefix`.
    ///
    /// A prefix that is already watched is left alone and `Ok(false)` is
    /// returned.
    pub async fn watch(
        &self,
        prefix: &str,
        handler: Arc<dyn WatchEventHandler>,
    ) -> Result<bool> {
        let registry = &self.inner.watchers;
        let Some((id, cancel)) = registry.reserve(prefix, &self.inner.shutdown) else {
            debug!("prefix {} already watched", prefix);
            return Ok(false);
        };

        let full = self.full_key(prefix);
        let events = match self.call("watch", self.inner.store.watch(&full, cancel.clone())).await {
            Ok(events) => events,
            Err(e) => {
                registry.release(prefix, id);
                return Err(e);
            }
        };

        let namespace = self.inner.namespace.clone();
        registry.spawn_dispatch(
            prefix.to_string(),
            id,
            cancel,
            events,
            move |key| strip(&namespace, key),
            handler,
        );
        debug!("watching prefix {}", prefix);
        Ok(true)
    }

    /// Cancels the subscription on `prefix`; unknown prefixes are only logged.
    pub fn unwatch(
        &self,
        prefix: &str,
    ) {
        if self.inner.watchers.cancel(prefix) {
            debug!("unwatched prefix {}", prefix);
        } else {
            debug!("unwatch: prefix {} is not watched", prefix);
        }
    }

    /// Stops keepalive, cancels every watch and revokes the lease.
    pub async fn close(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        self.inner.watchers.cancel_all();
        let lease = self.lease_id();
        match self.call("revoke", self.inner.store.revoke(lease)).await {
            Ok(()) => {
                info!("lease session {:x} closed", lease);
                Ok(())
            }
            Err(e) if matches!(e, crate::Error::Store(StoreError::LeaseNotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn full_key(
        &self,
        key: &str,
    ) -> String {
        join_namespace(&self.inner.namespace, key)
    }

    pub(crate) fn strip_namespace(
        &self,
        key: &str,
    ) -> String {
        strip(&self.inner.namespace, key)
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(op, self.inner.request_timeout, fut).await
    }
}

async fn with_timeout<T>(
    op: &'static str,
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, duration }.into()),
    }
}

fn normalize_namespace(namespace: &str) -> String {
    namespace.trim_end_matches('/').to_string()
}

fn join_namespace(
    namespace: &str,
    key: &str,
) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else if key.starts_with('/') {
        format!("{}{}", namespace, key)
    } else {
        format!("{}/{}", namespace, key)
    }
}

fn strip(
    namespace: &str,
    key: &str,
) -> String {
    if namespace.is_empty() {
        return key.to_string();
    }
    key.strip_prefix(namespace).unwrap_or(key).to_string()
}

/// Drains the keepalive channel of the current session. A closed channel
/// triggers the failure callback; the loop only ends with the client.
async fn keepalive_loop(inner: Weak<ClientInner>) {
    let mut failures: u32 = 0;
    'session: loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let shutdown = strong.shutdown.clone();
        let ready = strong.keepalive_ready.clone();
        let rx = strong.keepalive_slot.lock().take();
        drop(strong);

        if let Some(mut rx) = rx {
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ready.notified() => {
                        // restart_session installed a new session
                        let replaced = inner
                            .upgrade()
                            .map(|i| i.keepalive_slot.lock().is_some())
                            .unwrap_or(false);
                        if replaced {
                            continue 'session;
                        }
                        continue;
                    }
                    msg = rx.recv() => msg,
                };
                match msg {
                    Some(resp) => {
                        failures = 0;
                        trace!("lease {:x} renewed, ttl {}s", resp.id, resp.ttl);
                    }
                    None => break,
                }
            }
            if shutdown.is_cancelled() {
                return;
            }
            warn!("lease keepalive channel closed");
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let client = LeaseSessionClient { inner: strong };
        let callback = client.inner.on_keepalive_failure.lock().clone();

        let result = match callback {
            Some(cb) => cb(client.clone()).await,
            None => client.restart_session().await,
        };
        drop(client);

        match result {
            Ok(()) => {
                let restarted = inner
                    .upgrade()
                    .map(|i| i.keepalive_slot.lock().is_some())
                    .unwrap_or(false);
                if !restarted {
                    // custom callback did not restart; wait for someone to
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ready.notified() => {}
                    }
                }
            }
            Err(e) => {
                failures += 1;
                let backoff = std::cmp::min(RESTART_BACKOFF_BASE * 2u32.pow(failures.min(6)), RESTART_BACKOFF_MAX);
                error!(attempt = failures, error = %e, "keepalive recovery failed, retrying in {:?}", backoff);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sleep(backoff) => {}
                }
            }
        }
    }
}

/// Boxes an async closure into a [`SessionRestartedHook`].
pub fn session_restarted_hook<F, Fut>(f: F) -> SessionRestartedHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || f().boxed())
}
