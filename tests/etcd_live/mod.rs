//! Checks against a real etcd at `$ETCD_ENDPOINT` (default
//! `http://127.0.0.1:2379`). Built only with `--features etcd-tests`.
#![cfg(feature = "etcd-tests")]

use std::sync::Arc;
use std::time::Duration;

use etcd_coord::Elect;
use etcd_coord::ElectEvent;
use etcd_coord::ElectionConfig;
use etcd_coord::EtcdBackendForClient;
use etcd_coord::EtcdConfig;
use etcd_coord::EtcdInformerBackend;
use etcd_coord::Informer;
use etcd_coord::LeaseSessionClient;
use tokio_util::sync::CancellationToken;

use crate::common::informer_config;
use crate::common::next;
use crate::common::recorder;
use crate::common::Host;
use crate::common::Notification;
use crate::enable_logger;

fn live_config(namespace: &str) -> EtcdConfig {
    let endpoint = std::env::var("ETCD_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:2379".into());
    EtcdConfig {
        endpoints: vec![endpoint],
        namespace: format!("/etcd-coord-test/{}/{}", namespace, nanoid::nanoid!(6)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_live_put_get_and_session() {
    enable_logger();
    let client = LeaseSessionClient::connect(&live_config("kv")).await.unwrap();

    client.put("/a", "1").await.unwrap();
    assert_eq!(client.get("/a").await.unwrap(), b"1".to_vec());
    assert!(client.get("/missing").await.unwrap_err().is_not_found());

    client.put_session("/ephemeral", "x").await.unwrap();
    assert_eq!(client.delete("/a").await.unwrap(), Some(b"1".to_vec()));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_live_informer_round_trip() {
    enable_logger();
    let etcd = live_config("informer");
    let config = informer_config(&["hosts"]);

    let informer = Informer::new(&config);
    let producer = LeaseSessionClient::connect(&etcd).await.unwrap();
    informer
        .init(Arc::new(EtcdInformerBackend::new(producer.clone(), &config)))
        .unwrap();

    let consumer = EtcdBackendForClient::with_hostname(
        LeaseSessionClient::connect(&etcd).await.unwrap(),
        &config,
        "live-node",
    );
    consumer.start_client_watch().await.unwrap();
    let (handler, mut rx) = recorder();
    consumer.watch("hosts", handler).await.unwrap();

    informer.create_model(&Host::new("h1", "init")).unwrap();
    match next(&mut rx).await {
        Some(Notification::Add(obj)) => assert_eq!(obj["id"], "h1"),
        other => panic!("expected add, got {:?}", other),
    }

    informer.shutdown().await;
    consumer.unwatch("hosts").await.unwrap();
    consumer.client().close().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_live_election_win_and_step_down() {
    enable_logger();
    let etcd = live_config("election");
    let config = ElectionConfig {
        key: "live".into(),
        retry_interval_ms: 200,
        ..Default::default()
    };
    let elect = Elect::connect(&etcd, &config).await.unwrap();
    let cancel = CancellationToken::new();
    let mut events = elect.subscribe(cancel.clone());
    let campaign = tokio::spawn({
        let elect = elect.clone();
        let cancel = cancel.clone();
        async move { elect.start(cancel).await }
    });

    assert_eq!(events.recv().await, Some(ElectEvent::Init));
    let win = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert_eq!(win, Some(ElectEvent::Win));

    cancel.cancel();
    campaign.await.unwrap();
    assert_eq!(elect.latest_event(), ElectEvent::Lost);
}
