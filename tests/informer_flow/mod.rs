//! Producer and consumer in separate "processes" (own lease sessions) sharing
//! one store through the etcd informer backend.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use etcd_coord::EtcdBackendForClient;
use etcd_coord::EtcdInformerBackend;
use etcd_coord::EtcdModelManager;
use etcd_coord::Informer;
use etcd_coord::KvStore;
use etcd_coord::MemStore;
use etcd_coord::Result;
use etcd_coord::SyncClient;
use etcd_coord::SyncConfig;
use etcd_coord::SyncManager;
use serde_json::json;
use serde_json::Value;
use tonic::async_trait;

use crate::common::informer_config;
use crate::common::next;
use crate::common::process_client;
use crate::common::quiet;
use crate::common::recorder;
use crate::common::Host;
use crate::common::Notification;
use crate::common::NAMESPACE;
use crate::enable_logger;

async fn producer(store: &MemStore) -> Informer {
    let config = informer_config(&["hosts"]);
    let informer = Informer::new(&config);
    let backend = EtcdInformerBackend::new(process_client(store).await, &config);
    informer.init(Arc::new(backend)).unwrap();
    informer
}

async fn consumer(
    store: &MemStore,
    hostname: &str,
) -> EtcdBackendForClient {
    let consumer = EtcdBackendForClient::with_hostname(process_client(store).await, &informer_config(&[]), hostname);
    consumer.start_client_watch().await.unwrap();
    consumer
}

#[tokio::test]
async fn test_host_lifecycle_reaches_consumer_once_per_change() {
    enable_logger();
    let store = MemStore::new();
    let informer = producer(&store).await;
    let consumer = consumer(&store, "node-b").await;
    let (handler, mut rx) = recorder();
    consumer.watch("hosts", handler).await.unwrap();

    let created = Host::new("h1", "init");
    informer.create_model(&created).unwrap();
    assert_eq!(next(&mut rx).await, Some(Notification::Add(json!({"id": "h1", "status": "init"}))));
    quiet(&mut rx).await;

    let updated = Host::new("h1", "running");
    informer.update_model(&updated, &created).unwrap();
    assert_eq!(
        next(&mut rx).await,
        Some(Notification::Update(
            json!({"id": "h1", "status": "init"}),
            json!({"id": "h1", "status": "running"})
        ))
    );

    informer.delete_model(&updated).unwrap();
    assert_eq!(next(&mut rx).await, Some(Notification::Delete(json!({"id": "h1", "status": "running"}))));
    quiet(&mut rx).await;

    // notifications live under the namespace, bound to short-lived leases
    let raw = store.get(&format!("{}/onecloud/informer/hosts/h1", NAMESPACE)).await.unwrap();
    assert!(raw.map(|kv| kv.lease != 0).unwrap_or(true));

    informer.shutdown().await;
}

#[tokio::test]
async fn test_every_consumer_host_receives_the_change() {
    enable_logger();
    let store = MemStore::new();
    let informer = producer(&store).await;
    let node_b = consumer(&store, "node-b").await;
    let node_c = consumer(&store, "node-c").await;
    let (handler_b, mut rx_b) = recorder();
    let (handler_c, mut rx_c) = recorder();
    node_b.watch("hosts", handler_b).await.unwrap();
    node_c.watch("hosts", handler_c).await.unwrap();

    informer.create_model(&Host::new("h1", "init")).unwrap();

    assert!(matches!(next(&mut rx_b).await, Some(Notification::Add(_))));
    assert!(matches!(next(&mut rx_c).await, Some(Notification::Add(_))));
    quiet(&mut rx_b).await;
    quiet(&mut rx_c).await;
    informer.shutdown().await;
}

#[tokio::test]
async fn test_notification_expiry_is_not_a_delete() {
    enable_logger();
    let store = MemStore::new();
    let config = informer_config(&["hosts"]);
    let producer_client = process_client(&store).await;
    let informer = Informer::new(&config);
    informer
        .init(Arc::new(EtcdInformerBackend::new(producer_client.clone(), &config)))
        .unwrap();
    let consumer = consumer(&store, "node-b").await;
    let (handler, mut rx) = recorder();
    consumer.watch("hosts", handler).await.unwrap();

    informer.create_model(&Host::new("h1", "init")).unwrap();
    assert!(matches!(next(&mut rx).await, Some(Notification::Add(_))));

    let key = format!("{}/onecloud/informer/hosts/h1", NAMESPACE);
    let lease = store.get(&key).await.unwrap().unwrap().lease;
    assert!(store.expire_lease(lease));
    assert!(store.get(&key).await.unwrap().is_none());

    quiet(&mut rx).await;
    informer.shutdown().await;
}

#[tokio::test]
async fn test_consumer_keeps_receiving_after_session_loss() {
    enable_logger();
    let store = MemStore::new();
    let informer = producer(&store).await;
    let consumer = consumer(&store, "node-b").await;
    let (handler, mut rx) = recorder();
    consumer.watch("hosts", handler).await.unwrap();

    let old_lease = consumer.client().lease_id();
    assert!(store.expire_lease(old_lease));

    // wait for the presence key to come back on the new session
    let presence = format!("{}/onecloud/informer/hosts/__informer_clients__/node-b", NAMESPACE);
    let mut rebuilt = false;
    for _ in 0..100 {
        if let Some(kv) = store.get(&presence).await.unwrap() {
            if kv.lease != old_lease {
                rebuilt = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rebuilt, "presence key not re-announced");

    informer.create_model(&Host::new("h2", "init")).unwrap();
    match next(&mut rx).await {
        Some(Notification::Add(obj)) => assert_eq!(obj["id"], "h2"),
        other => panic!("expected add of h2, got {:?}", other),
    }
    informer.shutdown().await;
}

/// Counts resyncs; only hosts marked dirty need one
struct HostSync {
    runs: AtomicUsize,
}

#[async_trait]
impl SyncClient for HostSync {
    async fn do_sync(
        &self,
        _first: bool,
        _timeout: bool,
    ) -> Result<Duration> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Duration::from_secs(3600))
    }

    fn need_sync(
        &self,
        obj: &Value,
    ) -> bool {
        obj["status"] == "dirty"
    }

    fn name(&self) -> String {
        "hosts".into()
    }
}

#[tokio::test]
async fn test_notifications_drive_debounced_resync() {
    enable_logger();
    let store = MemStore::new();
    let informer = producer(&store).await;
    let consumer = consumer(&store, "node-b").await;

    let sync = Arc::new(HostSync {
        runs: AtomicUsize::new(0),
    });
    let manager = SyncManager::new(sync.clone(), &SyncConfig { min_interval_ms: 10 });
    consumer.watch("hosts", Arc::new(manager.clone())).await.unwrap();

    informer.create_model(&Host::new("h1", "init")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sync.runs.load(Ordering::SeqCst), 0);

    informer
        .update_model(&Host::new("h1", "dirty"), &Host::new("h1", "init"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sync.runs.load(Ordering::SeqCst), 1);

    manager.stop().await;
    informer.shutdown().await;
}

#[tokio::test]
async fn test_model_snapshot_next_to_notification() {
    enable_logger();
    let store = MemStore::new();
    let client = process_client(&store).await;
    let models = EtcdModelManager::new(client, "hosts");
    let informer = producer(&store).await;
    let consumer = consumer(&store, "node-b").await;
    let (handler, mut rx) = recorder();
    consumer.watch("hosts", handler).await.unwrap();

    let host = Host::new("h1", "running");
    models.save(&host).await.unwrap();
    informer.create_model(&host).unwrap();

    assert!(matches!(next(&mut rx).await, Some(Notification::Add(_))));
    // the snapshot lives outside the informer prefix and produced no event
    quiet(&mut rx).await;
    let loaded: Host = models.get("h1").await.unwrap();
    assert_eq!(loaded, host);
    informer.shutdown().await;
}
