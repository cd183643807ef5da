use std::sync::Arc;
use std::time::Duration;

use etcd_coord::EtcdConfig;
use etcd_coord::InformerConfig;
use etcd_coord::KvStore;
use etcd_coord::LeaseSessionClient;
use etcd_coord::MemStore;
use etcd_coord::ModelObject;
use etcd_coord::ResourceEventHandler;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const NAMESPACE: &str = "/region1";

pub fn etcd_config() -> EtcdConfig {
    EtcdConfig {
        namespace: NAMESPACE.to_string(),
        request_timeout_ms: 1000,
        ..Default::default()
    }
}

pub fn informer_config(watch_resources: &[&str]) -> InformerConfig {
    InformerConfig {
        watch_resources: watch_resources.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// A client with its own lease session on a shared in-memory store, the way
/// separate processes share one etcd cluster.
pub async fn process_client(store: &MemStore) -> LeaseSessionClient {
    let store: Arc<dyn KvStore> = Arc::new(store.clone());
    LeaseSessionClient::new(store, &etcd_config()).await.unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub status: String,
}

impl Host {
    pub fn new(
        id: &str,
        status: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            status: status.to_string(),
        }
    }
}

impl ModelObject for Host {
    fn keyword_plural(&self) -> &str {
        "hosts"
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Add(Value),
    Update(Value, Value),
    Delete(Value),
}

pub struct Recorder {
    tx: mpsc::UnboundedSender<Notification>,
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

impl ResourceEventHandler for Recorder {
    fn on_add(
        &self,
        obj: &Value,
    ) {
        let _ = self.tx.send(Notification::Add(obj.clone()));
    }

    fn on_update(
        &self,
        old_obj: &Value,
        new_obj: &Value,
    ) {
        let _ = self.tx.send(Notification::Update(old_obj.clone(), new_obj.clone()));
    }

    fn on_delete(
        &self,
        obj: &Value,
    ) {
        let _ = self.tx.send(Notification::Delete(obj.clone()));
    }
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
}

pub async fn quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected notification: {:?}", item);
    }
}
