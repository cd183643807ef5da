//! Several service replicas campaigning on one election key.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use etcd_coord::Elect;
use etcd_coord::ElectEvent;
use etcd_coord::ElectionConfig;
use etcd_coord::KvStore;
use etcd_coord::MemStore;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::NAMESPACE;
use crate::enable_logger;

struct Replica {
    elect: Elect,
    cancel: CancellationToken,
    leading: Arc<AtomicUsize>,
}

fn replica(store: &Arc<dyn KvStore>) -> Replica {
    let config = ElectionConfig {
        key: "scheduler".into(),
        session_ttl_secs: 3,
        retry_interval_ms: 100,
        ..Default::default()
    };
    let elect = Elect::new(store.clone(), NAMESPACE, &config).unwrap();
    let cancel = CancellationToken::new();
    let leading = Arc::new(AtomicUsize::new(0));

    let on_win = {
        let leading = leading.clone();
        move || {
            leading.store(1, Ordering::SeqCst);
        }
    };
    let on_lost = {
        let leading = leading.clone();
        move || {
            leading.store(0, Ordering::SeqCst);
        }
    };
    elect.subscribe_with_action(cancel.clone(), on_win, on_lost);

    tokio::spawn({
        let elect = elect.clone();
        let cancel = cancel.clone();
        async move { elect.start(cancel).await }
    });
    Replica { elect, cancel, leading }
}

async fn leader_of(replicas: &[Replica]) -> usize {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let leaders: Vec<usize> = (0..replicas.len()).filter(|i| replicas[*i].elect.is_leader()).collect();
        assert!(leaders.len() <= 1, "several leaders: {:?}", leaders);
        if let &[leader] = leaders.as_slice() {
            return leader;
        }
        assert!(Instant::now() < deadline, "no leader");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leadership_moves_when_leader_shuts_down() {
    enable_logger();
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let replicas: Vec<Replica> = (0..3).map(|_| replica(&store)).collect();

    let first = leader_of(&replicas).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(replicas[first].leading.load(Ordering::SeqCst), 1);

    replicas[first].cancel.cancel();
    let second = leader_of(&replicas).await;
    assert_ne!(first, second);
    assert_eq!(replicas[first].elect.latest_event(), ElectEvent::Lost);

    sleep(Duration::from_millis(50)).await;
    let acting: usize = replicas.iter().map(|r| r.leading.load(Ordering::SeqCst)).sum();
    assert_eq!(acting, 1);

    for r in &replicas {
        r.cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_losing_its_lease_hands_over() {
    enable_logger();
    let mem = MemStore::new();
    let store: Arc<dyn KvStore> = Arc::new(mem.clone());
    let replicas: Vec<Replica> = (0..2).map(|_| replica(&store)).collect();

    let first = leader_of(&replicas).await;
    let owners = mem.list(replicas[first].elect.path()).await.unwrap();
    let owner = owners.iter().min_by_key(|kv| kv.create_revision).unwrap();
    assert!(mem.expire_lease(owner.lease));

    // the other replica was queued on the mutex and takes over
    let second = 1 - first;
    let started = Instant::now();
    while !replicas[second].elect.is_leader() {
        assert!(started.elapsed() < Duration::from_secs(1), "no handover");
        sleep(Duration::from_millis(5)).await;
    }
    while replicas[first].elect.is_leader() {
        assert!(started.elapsed() < Duration::from_secs(1), "old leader did not step down");
        sleep(Duration::from_millis(5)).await;
    }

    for r in &replicas {
        r.cancel.cancel();
    }
}
