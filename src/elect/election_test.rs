use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::ElectionConfig;
use crate::KvStore;
use crate::MemStore;
use crate::MockKvStore;
use crate::StoreError;

fn election_config(retry_interval_ms: u64) -> ElectionConfig {
    ElectionConfig {
        key: "region".into(),
        session_ttl_secs: 3,
        retry_interval_ms,
        ..Default::default()
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ElectEvent>) -> Option<ElectEvent> {
    timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
}

fn run(
    elect: &Elect,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let elect = elect.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { elect.start(cancel).await })
}

/// Polls until exactly one instance leads, asserting there is never more.
async fn wait_for_single_leader(instances: &[(Elect, CancellationToken, JoinHandle<()>)]) -> usize {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let leaders: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, (elect, _, _))| elect.is_leader())
            .map(|(i, _)| i)
            .collect();
        assert!(leaders.len() <= 1, "several leaders: {:?}", leaders);
        if let Some(leader) = leaders.first() {
            return *leader;
        }
        assert!(Instant::now() < deadline, "no leader elected");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_new_rejects_empty_key() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    assert!(Elect::new(store, "/ns", &ElectionConfig::default()).is_err());
}

#[tokio::test]
async fn test_mutex_path_is_namespaced() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns/", &election_config(100)).unwrap();
    assert_eq!(elect.path(), "/ns/onecloud/lock/region");
    assert_eq!(elect.latest_event(), ElectEvent::Init);
    assert!(!elect.is_leader());
}

#[tokio::test]
async fn test_single_candidate_wins() {
    let store = MemStore::new();
    let elect = Elect::new(Arc::new(store.clone()), "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let mut rx = elect.subscribe(cancel.clone());
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Init));

    let handle = run(&elect, &cancel);
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Win));
    assert!(elect.is_leader());
    assert_eq!(store.list(elect.path()).await.unwrap().len(), 1);

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(elect.latest_event(), ElectEvent::Lost);
    assert!(store.list(elect.path()).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_leader_and_prompt_handover() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let retry = Duration::from_millis(200);

    let mut instances = Vec::new();
    for _ in 0..5 {
        let elect = Elect::new(store.clone(), "/ns", &election_config(retry.as_millis() as u64)).unwrap();
        let cancel = CancellationToken::new();
        let handle = run(&elect, &cancel);
        instances.push((elect, cancel, handle));
    }

    let first = wait_for_single_leader(&instances).await;
    for _ in 0..50 {
        let leaders = instances.iter().filter(|(elect, _, _)| elect.is_leader()).count();
        assert_eq!(leaders, 1);
        sleep(Duration::from_millis(10)).await;
    }

    let (_, cancel, _) = &instances[first];
    cancel.cancel();
    let handle = std::mem::replace(&mut instances[first].2, tokio::spawn(async {}));
    handle.await.unwrap();
    assert!(!instances[first].0.is_leader());

    let started = Instant::now();
    let second = wait_for_single_leader(&instances).await;
    assert_ne!(first, second);
    assert!(started.elapsed() < retry * 3, "handover took {:?}", started.elapsed());

    for (_, cancel, handle) in instances {
        cancel.cancel();
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_late_subscriber_receives_current_state() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let handle = run(&elect, &cancel);

    let mut early = elect.subscribe(cancel.clone());
    while let Some(event) = next_event(&mut early).await {
        if event == ElectEvent::Win {
            break;
        }
    }

    let mut late = elect.subscribe(cancel.clone());
    assert_eq!(next_event(&mut late).await, Some(ElectEvent::Win));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_action_subscriber_acts_on_latest_state_only() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns", &election_config(100)).unwrap();
    let wins = Arc::new(AtomicUsize::new(0));
    let losts = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let handle = elect.subscribe_with_action(
        cancel.clone(),
        {
            let wins = wins.clone();
            move || {
                wins.fetch_add(1, Ordering::SeqCst);
            }
        },
        {
            let losts = losts.clone();
            move || {
                losts.fetch_add(1, Ordering::SeqCst);
            }
        },
    );

    // both land in the buffer before the action task gets to run
    elect.notify(ElectEvent::Win);
    elect.notify(ElectEvent::Lost);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(wins.load(Ordering::SeqCst), 0);
    assert_eq!(losts.load(Ordering::SeqCst), 1);

    elect.notify(ElectEvent::Win);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(wins.load(Ordering::SeqCst), 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_repeated_state_is_not_rebroadcast() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let mut rx = elect.subscribe(cancel.clone());
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Init));

    elect.notify(ElectEvent::Lost);
    elect.notify(ElectEvent::Lost);
    elect.notify(ElectEvent::Init);
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Lost));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    cancel.cancel();
}

#[tokio::test]
async fn test_stop_steps_down_and_releases_mutex() {
    let store = MemStore::new();
    let elect = Elect::new(Arc::new(store.clone()), "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let mut rx = elect.subscribe(cancel.clone());
    let handle = run(&elect, &cancel);

    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Init));
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Win));

    elect.stop();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Lost));
    assert!(store.list(elect.path()).await.unwrap().is_empty());
    assert_eq!(store.lease_count(), 0);

    // a stopped election does not campaign again
    timeout(Duration::from_secs(1), elect.start(CancellationToken::new()))
        .await
        .unwrap();
    assert!(!elect.is_leader());
}

#[tokio::test]
async fn test_session_loss_steps_down_then_wins_again() {
    let store = MemStore::new();
    let elect = Elect::new(Arc::new(store.clone()), "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let mut rx = elect.subscribe(cancel.clone());
    let handle = run(&elect, &cancel);

    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Init));
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Win));

    let owner = store.list(elect.path()).await.unwrap();
    assert_eq!(owner.len(), 1);
    assert!(store.expire_lease(owner[0].lease));

    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Lost));
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Win));
    let owner_again = store.list(elect.path()).await.unwrap();
    assert_eq!(owner_again.len(), 1);
    assert_ne!(owner_again[0].lease, owner[0].lease);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_session_failure_reports_lost_and_retries() {
    let mut store = MockKvStore::new();
    store
        .expect_grant()
        .times(2..)
        .returning(|_| Err(StoreError::Connect("connection refused".into()).into()));

    let elect = Elect::new(Arc::new(store), "", &election_config(1000)).unwrap();
    let cancel = CancellationToken::new();
    let mut rx = elect.subscribe(cancel.clone());
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Init));

    let handle = run(&elect, &cancel);
    assert_eq!(next_event(&mut rx).await, Some(ElectEvent::Lost));

    sleep(Duration::from_millis(1500)).await;
    assert!(!elect.is_leader());

    cancel.cancel();
    handle.await.unwrap();
}

fn counting_actions(
    elect: &Elect,
    cancel: &CancellationToken,
) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, JoinHandle<()>) {
    let wins = Arc::new(AtomicUsize::new(0));
    let losts = Arc::new(AtomicUsize::new(0));
    let handle = elect.subscribe_with_action(
        cancel.clone(),
        {
            let wins = wins.clone();
            move || {
                wins.fetch_add(1, Ordering::SeqCst);
            }
        },
        {
            let losts = losts.clone();
            move || {
                losts.fetch_add(1, Ordering::SeqCst);
            }
        },
    );
    (wins, losts, handle)
}

#[tokio::test]
async fn test_action_subscriber_on_campaign_token_steps_down() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns", &election_config(100)).unwrap();
    let cancel = CancellationToken::new();
    let (wins, losts, actions) = counting_actions(&elect, &cancel);
    let campaign = run(&elect, &cancel);

    let deadline = Instant::now() + Duration::from_secs(2);
    while wins.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "never won");
        sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    campaign.await.unwrap();
    timeout(Duration::from_secs(1), actions).await.unwrap().unwrap();

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(losts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_action_subscriber_stops_acting_while_still_leader() {
    let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
    let elect = Elect::new(store, "/ns", &election_config(100)).unwrap();
    let campaign_cancel = CancellationToken::new();
    let subscriber_cancel = CancellationToken::new();
    let (wins, losts, actions) = counting_actions(&elect, &subscriber_cancel);
    let campaign = run(&elect, &campaign_cancel);

    let deadline = Instant::now() + Duration::from_secs(2);
    while wins.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "never won");
        sleep(Duration::from_millis(5)).await;
    }

    subscriber_cancel.cancel();
    timeout(Duration::from_secs(1), actions).await.unwrap().unwrap();
    assert!(elect.is_leader());
    assert_eq!(losts.load(Ordering::SeqCst), 1);

    campaign_cancel.cancel();
    campaign.await.unwrap();
}
