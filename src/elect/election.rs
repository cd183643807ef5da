use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ElectEvent;
use super::ElectionSession;
use super::ElectionTicket;
use crate::ElectionConfig;
use crate::ElectionError;
use crate::EtcdConfig;
use crate::EtcdStore;
use crate::KvStore;
use crate::Result;

const SUBSCRIBER_BUFFER: usize = 4;
const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ElectEvent>,
}

struct ElectState {
    latest: ElectEvent,
    subscribers: Vec<Subscriber>,
}

struct ElectInner {
    store: Arc<dyn KvStore>,
    path: String,
    candidate: String,
    session_ttl: i64,
    retry_interval: Duration,
    /// Latest event and subscribers share one lock so that a subscriber never
    /// misses the transition racing with its registration
    state: Mutex<ElectState>,
    next_subscriber: AtomicU64,
    stop: CancellationToken,
}

/// Campaigns for an etcd mutex and reports Win/Lost to subscribers.
#[derive(Clone)]
pub struct Elect {
    inner: Arc<ElectInner>,
}

impl std::fmt::Debug for Elect {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Elect")
            .field("path", &self.inner.path)
            .field("candidate", &self.inner.candidate)
            .field("latest", &self.latest_event())
            .finish()
    }
}

impl Elect {
    /// Dials etcd for a dedicated election connection.
    pub async fn connect(
        etcd: &EtcdConfig,
        config: &ElectionConfig,
    ) -> Result<Self> {
        let store = EtcdStore::connect(etcd).await?;
        Self::new(Arc::new(store), &etcd.namespace, config)
    }

    /// The mutex lives at `{namespace}{lock_prefix}/{key}`.
    pub fn new(
        store: Arc<dyn KvStore>,
        namespace: &str,
        config: &ElectionConfig,
    ) -> Result<Self> {
        if config.key.is_empty() {
            return Err(ElectionError::Lock {
                key: config.lock_prefix.clone(),
                reason: "empty election key".into(),
            }
            .into());
        }
        let path = format!(
            "{}{}/{}",
            namespace.trim_end_matches('/'),
            config.lock_prefix,
            config.key
        );
        Ok(Self {
            inner: Arc::new(ElectInner {
                store,
                path,
                candidate: nanoid::nanoid!(10),
                session_ttl: config.session_ttl_secs,
                retry_interval: config.retry_interval(),
                state: Mutex::new(ElectState {
                    latest: ElectEvent::Init,
                    subscribers: Vec::new(),
                }),
                next_subscriber: AtomicU64::new(0),
                stop: CancellationToken::new(),
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Random id of this campaigner, for logs
    pub fn candidate(&self) -> &str {
        &self.inner.candidate
    }

    pub fn latest_event(&self) -> ElectEvent {
        self.inner.state.lock().latest
    }

    pub fn is_leader(&self) -> bool {
        self.latest_event() == ElectEvent::Win
    }

    /// Ends `start` as if its token had been cancelled.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Campaign loop. Returns once `cancel` fires or `stop` is called.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) {
        let inner = &self.inner;
        info!(path = %inner.path, candidate = %inner.candidate, "election started");

        loop {
            if self.cancelled(&cancel) {
                break;
            }

            let (ticket, result) = self.campaign(&cancel).await;
            if let Err(e) = result {
                ticket.release(&inner.store).await;
                if self.cancelled(&cancel) {
                    break;
                }
                warn!(path = %inner.path, error = %e, "campaign failed");
                self.notify(ElectEvent::Lost);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.stop.cancelled() => break,
                    _ = sleep(self.retry_delay()) => {}
                }
                continue;
            }

            info!(path = %inner.path, candidate = %inner.candidate, "won election");
            self.notify(ElectEvent::Win);

            let session_done = match &ticket.session {
                Some(session) => session.done().clone(),
                None => CancellationToken::new(),
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = inner.stop.cancelled() => {}
                _ = session_done.cancelled() => {
                    warn!(path = %inner.path, "election session lost");
                }
            }

            // step down before anyone else can take over
            self.notify(ElectEvent::Lost);
            ticket.release(&inner.store).await;
        }

        if self.latest_event() == ElectEvent::Win {
            self.notify(ElectEvent::Lost);
        }
        info!(path = %inner.path, candidate = %inner.candidate, "election stopped");
    }

    /// One attempt: open a session, then wait for the mutex. The ticket holds
    /// whatever was acquired, also on failure.
    async fn campaign(
        &self,
        cancel: &CancellationToken,
    ) -> (ElectionTicket, Result<()>) {
        let inner = &self.inner;
        let mut ticket = ElectionTicket::default();

        let session = match ElectionSession::open(&inner.store, inner.session_ttl, SESSION_OPEN_TIMEOUT).await {
            Ok(session) => session,
            Err(e) => return (ticket, Err(e)),
        };
        let lease_id = session.lease_id();
        let session_done = session.done().clone();
        ticket.session = Some(session);

        let locked = tokio::select! {
            _ = cancel.cancelled() => Err(ElectionError::Stopped.into()),
            _ = inner.stop.cancelled() => Err(ElectionError::Stopped.into()),
            _ = session_done.cancelled() => Err(ElectionError::Session("lease lost while waiting for lock".into()).into()),
            locked = inner.store.lock(&inner.path, lease_id) => locked,
        };

        match locked {
            Ok(key) => {
                debug!(path = %inner.path, key = %key, "lock acquired");
                ticket.lock_key = Some(key);
                (ticket, Ok(()))
            }
            Err(e) => (ticket, Err(e)),
        }
    }

    /// Retry interval plus up to 25% jitter
    fn retry_delay(&self) -> Duration {
        let base = self.inner.retry_interval;
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    fn cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> bool {
        cancel.is_cancelled() || self.inner.stop.is_cancelled()
    }

    /// Broadcasts state changes. Repeated states and `Init` are not sent;
    /// a subscriber whose buffer is full misses the update.
    pub(super) fn notify(
        &self,
        event: ElectEvent,
    ) {
        let mut state = self.inner.state.lock();
        if state.latest == event || event == ElectEvent::Init {
            return;
        }
        state.latest = event;
        state.subscribers.retain(|sub| match sub.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "election subscriber lagging, drop {:?}", event);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Registers a subscriber. The current state is delivered right away;
    /// the channel closes when `cancel` fires. Events published after that,
    /// including the final `Lost` of a campaign sharing the same token, may
    /// not be delivered.
    pub fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ElectEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            let _ = tx.try_send(state.latest);
            state.subscribers.push(Subscriber { id, tx });
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().subscribers.retain(|sub| sub.id != id);
            }
        });
        rx
    }

    /// Runs `on_win`/`on_lost` for state changes, always acting on the most
    /// recent state only.
    ///
    /// Once `cancel` fires the subscription ends; if the last action taken was
    /// `on_win`, `on_lost` runs once more before the task returns.
    pub fn subscribe_with_action<W, L>(
        &self,
        cancel: CancellationToken,
        on_win: W,
        on_lost: L,
    ) -> JoinHandle<()>
    where
        W: Fn() + Send + 'static,
        L: Fn() + Send + 'static,
    {
        let mut rx = self.subscribe(cancel);
        tokio::spawn(async move {
            let mut acting = false;
            // the channel closes once the subscription is cancelled
            while let Some(mut event) = rx.recv().await {
                while let Ok(next) = rx.try_recv() {
                    event = next;
                }
                match event {
                    ElectEvent::Win => {
                        acting = true;
                        on_win();
                    }
                    ElectEvent::Lost => {
                        acting = false;
                        on_lost();
                    }
                    ElectEvent::Init => {}
                }
            }
            if acting {
                on_lost();
            }
        })
    }
}
