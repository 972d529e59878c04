//! Integration tests for leader election across several nodes sharing one store

use failover_election::{
    CoordinationClient, ElectionFactory, ElectorState, FailoverConfig, GroupWatcher,
    LeaderElector, Member, MemoryStore,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::fmt::try_init;

const LEADER_KEY: &str = "/group0/consensus";

/// One candidate node with its recorded notifications
struct TestNode {
    elector: LeaderElector,
    results: Arc<Mutex<Vec<bool>>>,
    keep_alive_failures: Arc<AtomicUsize>,
}

impl TestNode {
    fn new(store: &Arc<MemoryStore>, member_id: &str) -> Self {
        let config = FailoverConfig::new(member_id).with_lease_ttl(3);
        let factory = ElectionFactory::new(store.clone(), config).unwrap();
        let elector = factory
            .create_leader_elector(LEADER_KEY, "consensus", member_id.as_bytes().to_vec())
            .unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        elector.on_campaign_result(move |is_leader| sink.lock().unwrap().push(is_leader));

        let keep_alive_failures = Arc::new(AtomicUsize::new(0));
        let counter = keep_alive_failures.clone();
        elector.on_keep_alive_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            elector,
            results,
            keep_alive_failures,
        }
    }

    fn results(&self) -> Vec<bool> {
        self.results.lock().unwrap().clone()
    }
}

async fn holder(store: &MemoryStore) -> Option<String> {
    let kv = store.get(LEADER_KEY).await.ok()?;
    Member::decode(&kv.value)
        .ok()
        .map(|m| m.member_id().to_string())
}

/// Two nodes race for the key: the first transaction wins, the other backs off
#[tokio::test(start_paused = true)]
async fn test_two_nodes_race_for_leadership() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    let node1 = TestNode::new(&store, "node1");
    let node2 = TestNode::new(&store, "node2");

    node1.elector.start().await.unwrap();
    node2.elector.start().await.unwrap();
    assert!(!node2.elector.campaign_leader().await);

    assert_eq!(node1.elector.state(), ElectorState::Leading);
    assert_eq!(node1.results(), vec![true]);

    assert_eq!(node2.elector.state(), ElectorState::Campaigning);
    assert!(!node2.elector.retry_timer_active());
    assert!(node2.results().iter().all(|won| !won));
    assert_eq!(holder(&store).await.as_deref(), Some("node1"));

    // The loser does not retry on its own while the leader is healthy
    sleep(Duration::from_secs(30)).await;
    assert!(node1.elector.is_leader());
    assert!(!node2.elector.is_leader());
    assert_eq!(node1.results(), vec![true]);

    node1.elector.stop();
    node2.elector.stop();
}

/// Transient store failures never produce a leadership claim
#[tokio::test(start_paused = true)]
async fn test_no_false_leadership_under_store_failure() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    store.fail_next_lease_grants(usize::MAX);
    let node = TestNode::new(&store, "node1");

    node.elector.start().await.unwrap();
    assert_eq!(node.results(), vec![false]);

    // One attempt per lease TTL
    for attempts in 2..=4 {
        sleep(Duration::from_millis(3050)).await;
        assert_eq!(node.results().len(), attempts);
        assert!(node.elector.retry_timer_active());
    }
    assert!(node.results().iter().all(|won| !won));
    assert!(!node.elector.is_leader());
    assert_eq!(holder(&store).await, None);

    node.elector.stop();
}

/// Campaign transactions timing out keep the retry timer running until one succeeds
#[tokio::test(start_paused = true)]
async fn test_transaction_timeouts_then_success() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    store.fail_next_transactions(3);
    let node = TestNode::new(&store, "node1");

    node.elector.start().await.unwrap();
    sleep(Duration::from_millis(3050)).await;
    sleep(Duration::from_millis(3000)).await;
    assert_eq!(node.results(), vec![false, false, false]);
    assert!(node.elector.retry_timer_active());

    sleep(Duration::from_millis(3000)).await;
    assert_eq!(node.results(), vec![false, false, false, true]);
    assert!(!node.elector.retry_timer_active());
    assert!(node.elector.is_leader());

    node.elector.stop();
}

/// A renewal failure is reported once and re-arms the retry timer
#[tokio::test(start_paused = true)]
async fn test_keep_alive_loss_triggers_recampaign() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    let node = TestNode::new(&store, "node1");
    node.elector.start().await.unwrap();
    assert!(node.elector.is_leader());

    store.fail_keep_alives(true);
    sleep(Duration::from_millis(2500)).await;

    assert_eq!(node.keep_alive_failures.load(Ordering::SeqCst), 1);
    assert_eq!(node.elector.state(), ElectorState::Campaigning);
    assert!(node.elector.retry_timer_active());

    store.fail_keep_alives(false);
    sleep(Duration::from_secs(4)).await;
    assert_eq!(node.keep_alive_failures.load(Ordering::SeqCst), 1);
    assert!(node.elector.is_leader());
    assert_eq!(holder(&store).await.as_deref(), Some("node1"));

    node.elector.stop();
}

/// The leader stalls past its TTL; the backup takes over once the lease expires
#[tokio::test(start_paused = true)]
async fn test_backup_takes_over_after_lease_expiry() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    let node1 = TestNode::new(&store, "node1");
    let node2 = TestNode::new(&store, "node2");
    node1.elector.start().await.unwrap();
    node2.elector.start().await.unwrap();

    let watcher = GroupWatcher::new(store.clone(), "/group0/", Default::default());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    watcher.add_change_handler(move |_, member| {
        sink.lock().unwrap().push(member.member_id().to_string());
        Ok(())
    });
    let deletes = Arc::new(AtomicUsize::new(0));
    let counter = deletes.clone();
    watcher.add_delete_handler(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    watcher.start().await.unwrap();

    // Renewals stop; the store-side lease runs out on its own schedule
    node1.elector.stop();
    sleep(Duration::from_secs(7)).await;

    assert!(node2.elector.is_leader());
    assert_eq!(node2.results().last(), Some(&true));
    assert_eq!(holder(&store).await.as_deref(), Some("node2"));

    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert_eq!(
        *changes.lock().unwrap(),
        vec!["node1".to_string(), "node2".to_string()]
    );
    assert_eq!(
        watcher.leader(LEADER_KEY).unwrap().member_id(),
        "node2"
    );

    node2.elector.stop();
    watcher.stop();
}

/// A store outage resets every cached view, yet leadership stays unique
#[tokio::test(start_paused = true)]
async fn test_outage_keeps_single_leader() {
    let _ = try_init();
    let store = Arc::new(MemoryStore::new());
    let node1 = TestNode::new(&store, "node1");
    let node2 = TestNode::new(&store, "node2");
    node1.elector.start().await.unwrap();
    node2.elector.start().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(node2.elector.coordinator().leader().is_some());

    store.set_available(false);
    sleep(Duration::from_secs(1)).await;
    store.set_available(true);
    sleep(Duration::from_secs(6)).await;

    let leaders = [&node1, &node2]
        .iter()
        .filter(|node| node.elector.is_leader())
        .count();
    assert_eq!(leaders, 1);
    assert_eq!(holder(&store).await.as_deref(), Some("node1"));

    // Recovery cleared the backup's cache; a read restores it
    assert!(node2.elector.coordinator().leader().is_none());
    let leader = node2.elector.coordinator().fetch_leader().await.unwrap();
    assert_eq!(leader.member_id(), "node1");

    node1.elector.stop();
    node2.elector.stop();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Concurrent campaigns for one key produce exactly one winner
    #[test]
    fn prop_at_most_one_leader(candidates in 2usize..8) {
        let winners = tokio_test::block_on(async move {
            let store = Arc::new(MemoryStore::new());
            let nodes: Vec<Arc<TestNode>> = (0..candidates)
                .map(|i| Arc::new(TestNode::new(&store, &format!("node{}", i))))
                .collect();

            let handles: Vec<_> = nodes
                .iter()
                .cloned()
                .map(|node| tokio::spawn(async move { node.elector.start().await }))
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let leaders: Vec<String> = nodes
                .iter()
                .filter(|node| node.elector.is_leader())
                .map(|node| node.elector.coordinator().params().member().member_id().to_string())
                .collect();
            let wins: usize = nodes
                .iter()
                .map(|node| node.results().iter().filter(|won| **won).count())
                .sum();
            let holder = holder(&store).await;

            for node in &nodes {
                node.elector.stop();
            }
            (leaders, wins, holder)
        });

        let (leaders, wins, holder) = winners;
        prop_assert_eq!(leaders.len(), 1);
        prop_assert_eq!(wins, 1);
        prop_assert_eq!(holder.as_ref(), leaders.first());
    }
}
