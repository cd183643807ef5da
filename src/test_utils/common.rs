use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::EtcdConfig;
use crate::KvStore;
use crate::LeaseSessionClient;
use crate::MemStore;
use crate::ResourceEventHandler;
use crate::WatchEvent;
use crate::WatchEventHandler;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub(crate) fn test_etcd_config(namespace: &str) -> EtcdConfig {
    EtcdConfig {
        namespace: namespace.to_string(),
        request_timeout_ms: 1000,
        ..Default::default()
    }
}

pub(crate) async fn mem_client(
    store: &MemStore,
    namespace: &str,
) -> LeaseSessionClient {
    let store: Arc<dyn KvStore> = Arc::new(store.clone());
    LeaseSessionClient::new(store, &test_etcd_config(namespace))
        .await
        .expect("open session on mem store")
}

/// Waits at most one second for the next item.
pub(crate) async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
}

/// Asserts nothing arrives for a short while.
pub(crate) async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected item: {:?}", item);
    }
}

/// Forwards every classified watch event into a channel
pub(crate) struct RecordingWatchHandler {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

pub(crate) fn recording_watch_handler() -> (Arc<RecordingWatchHandler>, mpsc::UnboundedReceiver<WatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingWatchHandler { tx }), rx)
}

impl WatchEventHandler for RecordingWatchHandler {
    fn on_create(
        &self,
        key: &str,
        value: &[u8],
    ) {
        let _ = self.tx.send(WatchEvent::Create {
            key: key.to_string(),
            value: value.to_vec(),
        });
    }

    fn on_modify(
        &self,
        key: &str,
        old_value: &[u8],
        new_value: &[u8],
    ) {
        let _ = self.tx.send(WatchEvent::Modify {
            key: key.to_string(),
            old_value: old_value.to_vec(),
            new_value: new_value.to_vec(),
        });
    }

    fn on_delete(
        &self,
        key: &str,
        prev_value: Option<Vec<u8>>,
    ) {
        let _ = self.tx.send(WatchEvent::Delete {
            key: key.to_string(),
            prev_value,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResourceEvent {
    Add(Value),
    Update { old: Value, new: Value },
    Delete(Value),
}

/// Forwards resource events into a channel
pub(crate) struct RecordingResourceHandler {
    tx: mpsc::UnboundedSender<ResourceEvent>,
}

pub(crate) fn recording_resource_handler() -> (Arc<RecordingResourceHandler>, mpsc::UnboundedReceiver<ResourceEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingResourceHandler { tx }), rx)
}

impl ResourceEventHandler for RecordingResourceHandler {
    fn on_add(
        &self,
        obj: &Value,
    ) {
        let _ = self.tx.send(ResourceEvent::Add(obj.clone()));
    }

    fn on_update(
        &self,
        old_obj: &Value,
        new_obj: &Value,
    ) {
        let _ = self.tx.send(ResourceEvent::Update {
            old: old_obj.clone(),
            new: new_obj.clone(),
        });
    }

    fn on_delete(
        &self,
        obj: &Value,
    ) {
        let _ = self.tx.send(ResourceEvent::Delete(obj.clone()));
    }
}
