//! Per-prefix watch subscriptions.
//!
//! Each subscription owns a cancellation token and one dispatch task that
//! turns raw etcd events into Create / Modify / Delete callbacks. At most one
//! subscription exists per prefix.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::RawEventKind;
use crate::RawWatchEvent;

/// Receives classified events for one watched prefix.
///
/// Keys are relative to the client namespace. Callbacks run on the dispatch
/// task of the subscription and must not block for long.
#[cfg_attr(test, automock)]
pub trait WatchEventHandler: Send + Sync + 'static {
    fn on_create(
        &self,
        _key: &str,
        _value: &[u8],
    ) {
    }

    fn on_modify(
        &self,
        _key: &str,
        _old_value: &[u8],
        _new_value: &[u8],
    ) {
    }

    /// `prev_value` is the last value seen before the key disappeared or was
    /// emptied, when etcd reported one.
    fn on_delete(
        &self,
        _key: &str,
        _prev_value: Option<Vec<u8>>,
    ) {
    }
}

/// A raw event after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Create {
        key: String,
        value: Vec<u8>,
    },
    Modify {
        key: String,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    Delete {
        key: String,
        prev_value: Option<Vec<u8>>,
    },
}

/// Classifies one raw event.
///
/// - an explicit delete, or a put carrying an empty value, is a Delete
/// - a put without previous KV is a Create
/// - anything else is a Modify, whose new value is never empty
pub fn classify(
    event: RawWatchEvent,
    key: String,
) -> WatchEvent {
    let RawWatchEvent { kind, kv, prev_kv } = event;
    if kind == RawEventKind::Delete || kv.value.is_empty() {
        return WatchEvent::Delete {
            key,
            prev_value: prev_kv.map(|p| p.value).filter(|v| !v.is_empty()),
        };
    }
    match prev_kv {
        None => WatchEvent::Create { key, value: kv.value },
        Some(prev) => WatchEvent::Modify {
            key,
            old_value: prev.value,
            new_value: kv.value,
        },
    }
}

pub(crate) fn dispatch(
    handler: &dyn WatchEventHandler,
    event: &WatchEvent,
) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match event {
        WatchEvent::Create { key, value } => handler.on_create(key, value),
        WatchEvent::Modify {
            key,
            old_value,
            new_value,
        } => handler.on_modify(key, old_value, new_value),
        WatchEvent::Delete { key, prev_value } => handler.on_delete(key, prev_value.clone()),
    }));
    if outcome.is_err() {
        error!("watch handler panicked on {:?}", event);
    }
}

struct WatchSubscription {
    id: u64,
    cancel: CancellationToken,
}

/// Registry of live prefix subscriptions
#[derive(Default)]
pub struct WatchRegistry {
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<String, WatchSubscription>>,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("prefixes", &self.prefixes())
            .finish()
    }
}

impl WatchRegistry {
    /// Reserves `prefix`. Returns `None` when it is already subscribed.
    pub(crate) fn reserve(
        &self,
        prefix: &str,
        parent: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(prefix) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        subscriptions.insert(
            prefix.to_string(),
            WatchSubscription {
                id,
                cancel: cancel.clone(),
            },
        );
        Some((id, cancel))
    }

    /// Drops the reservation `id` for `prefix` if it is still the current one.
    pub(crate) fn release(
        &self,
        prefix: &str,
        id: u64,
    ) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(prefix).map(|s| s.id) == Some(id) {
            if let Some(sub) = subscriptions.remove(prefix) {
                sub.cancel.cancel();
            }
        }
    }

    /// Cancels and removes the subscription for `prefix`.
    /// Returns false if there was none.
    pub fn cancel(
        &self,
        prefix: &str,
    ) -> bool {
        match self.subscriptions.lock().remove(prefix) {
            Some(sub) => {
                sub.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (prefix, sub) in self.subscriptions.lock().drain() {
            trace!("cancel watch on {}", prefix);
            sub.cancel.cancel();
        }
    }

    pub fn contains(
        &self,
        prefix: &str,
    ) -> bool {
        self.subscriptions.lock().contains_key(prefix)
    }

    /// Id of the live subscription for `prefix`. A new id means the watch
    /// was re-issued.
    pub fn subscription_id(
        &self,
        prefix: &str,
    ) -> Option<u64> {
        self.subscriptions.lock().get(prefix).map(|sub| sub.id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Runs the dispatch loop for one subscription until it is cancelled or
    /// the event stream ends.
    pub(crate) fn spawn_dispatch(
        self: &Arc<Self>,
        prefix: String,
        id: u64,
        cancel: CancellationToken,
        mut events: mpsc::Receiver<RawWatchEvent>,
        strip: impl Fn(&str) -> String + Send + 'static,
        handler: Arc<dyn WatchEventHandler>,
    ) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    debug!(prefix = %prefix, "watch stream closed");
                    break;
                };
                let key = strip(&event.kv.key);
                let event = classify(event, key);
                trace!(prefix = %prefix, ?event, "watch event");
                dispatch(handler.as_ref(), &event);
            }
            if let Some(registry) = registry.upgrade() {
                registry.release(&prefix, id);
            }
        });
    }
}
