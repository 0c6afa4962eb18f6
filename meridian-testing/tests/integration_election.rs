//! Leader election integration tests
//!
//! These tests run several member managers against one shared in-process
//! store and check that leadership is exclusive, survives lease expiry and
//! is handed over once the holder goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use meridian_core::{Member, MetaError};
use meridian_kvstore::{KVStore, KVStoreConfig};
use meridian_member::{LeadershipEnd, MemberConfig, MemberManager, MemberState};
use meridian_testing::{ElectionCluster, ElectionConfig, FaultyStore, PinnedLeader};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn member_config(id: u64, name: &str) -> MemberConfig {
    MemberConfig::new("/meta/cluster0", id, name)
        .with_rpc_timeout(Duration::from_secs(1))
        .with_leader_check_interval(Duration::from_millis(20))
}

async fn shared_store() -> Arc<KVStore> {
    Arc::new(
        KVStore::new(KVStoreConfig::default())
            .await
            .expect("Failed to create KVStore"),
    )
}

fn manager(store: &Arc<KVStore>, id: u64, name: &str) -> Arc<MemberManager> {
    Arc::new(
        MemberManager::new(member_config(id, name), Arc::clone(store), PinnedLeader::new(id))
            .expect("Failed to create member manager"),
    )
}

async fn wait_until_leading(manager: &MemberManager) {
    let mut state = manager.subscribe();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == MemberState::Leading),
    )
    .await
    .expect("member never became leader")
    .expect("state channel closed");
}

/// Concurrent campaigns: exactly one wins, all others lose the transaction
#[tokio::test]
async fn test_concurrent_campaigns_are_exclusive() {
    init_logging();

    let store = shared_store().await;
    let managers: Vec<_> = (1..=5)
        .map(|id| manager(&store, id, &format!("node-{}", id)))
        .collect();
    let cancel = CancellationToken::new();

    let campaigns = managers.iter().map(|m| {
        let m = Arc::clone(m);
        let cancel = cancel.clone();
        tokio::spawn(async move { m.campaign_and_keep_leader(&cancel, 5).await })
    });
    let campaigns: Vec<_> = campaigns.collect();

    // losers return right away, the winner keeps leading
    tokio::time::sleep(Duration::from_millis(200)).await;
    let leaders: Vec<_> = managers.iter().filter(|m| m.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one member must lead");

    let winner = leaders[0].member().clone();
    let current = managers[0]
        .get_leader(&CancellationToken::new())
        .await
        .expect("get leader failed");
    assert_eq!(current.leader, Some(winner));

    cancel.cancel();
    let results = join_all(campaigns).await;
    let mut won = 0;
    let mut lost = 0;
    for result in results {
        match result.expect("campaign task panicked") {
            Ok(LeadershipEnd::Canceled) => won += 1,
            Err(MetaError::TxnPutLeaderFailed { .. }) => lost += 1,
            other => panic!("unexpected campaign outcome: {:?}", other),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(lost, 4);
}

/// Two named members with a five second lease: one leads, the other loses
#[tokio::test]
async fn test_two_members_one_leader() {
    init_logging();

    let store = shared_store().await;
    let a = manager(&store, 1, "a");
    let b = manager(&store, 2, "b");
    let cancel = CancellationToken::new();

    let campaign_a = {
        let a = Arc::clone(&a);
        let cancel = cancel.clone();
        tokio::spawn(async move { a.campaign_and_keep_leader(&cancel, 5).await })
    };
    wait_until_leading(&a).await;

    let result = b.campaign_and_keep_leader(&cancel, 5).await;
    assert!(
        matches!(result, Err(MetaError::TxnPutLeaderFailed { .. })),
        "second campaign should lose, got {:?}",
        result
    );

    for m in [&a, &b] {
        let current = m.get_leader(&CancellationToken::new()).await.unwrap();
        assert_eq!(current.leader, Some(Member::new(1, "a")));
    }

    cancel.cancel();
    assert_eq!(campaign_a.await.unwrap().unwrap(), LeadershipEnd::Canceled);
}

/// A canceled leader returns within a tick but keeps the key until the TTL
#[tokio::test]
async fn test_cancel_then_ttl_expiry() {
    init_logging();

    let store = shared_store().await;
    let a = manager(&store, 1, "a");
    let cancel = CancellationToken::new();

    let campaign = {
        let a = Arc::clone(&a);
        let cancel = cancel.clone();
        tokio::spawn(async move { a.campaign_and_keep_leader(&cancel, 1).await })
    };
    wait_until_leading(&a).await;

    let canceled_at = Instant::now();
    cancel.cancel();
    let end = timeout(Duration::from_millis(200), campaign)
        .await
        .expect("campaign did not return after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(end, LeadershipEnd::Canceled);
    assert!(canceled_at.elapsed() < Duration::from_millis(200));

    let still_there = a.get_leader(&CancellationToken::new()).await.unwrap();
    assert_eq!(still_there.leader, Some(Member::new(1, "a")));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let gone = a.get_leader(&CancellationToken::new()).await.unwrap();
    assert!(gone.leader.is_none());
}

/// The follower takes over once the leader's lease lapses
#[tokio::test]
async fn test_failover_after_lease_expiry() {
    init_logging();

    let inner = shared_store().await;
    let store = Arc::new(FaultyStore::new(Arc::clone(&inner)));
    let new_manager = |id: u64, name: &str| {
        Arc::new(
            MemberManager::new(member_config(id, name), Arc::clone(&store), PinnedLeader::new(id))
                .unwrap(),
        )
    };
    let a = new_manager(1, "a");
    let b = new_manager(2, "b");

    let campaign_a = {
        let a = Arc::clone(&a);
        tokio::spawn(async move {
            a.campaign_and_keep_leader(&CancellationToken::new(), 1)
                .await
        })
    };
    wait_until_leading(&a).await;

    let current = b.get_leader(&CancellationToken::new()).await.unwrap();
    assert_eq!(current.leader, Some(Member::new(1, "a")));

    store.partition_keep_alive();
    let end = timeout(Duration::from_secs(1), campaign_a)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(end, LeadershipEnd::LeaseLapsed);
    store.heal_keep_alive();

    // the key outlives the old leader until its lease expires
    timeout(
        Duration::from_secs(3),
        b.wait_for_leader_change(&CancellationToken::new(), current.revision),
    )
    .await
    .expect("leader key was never deleted");

    let cancel = CancellationToken::new();
    let campaign_b = {
        let b = Arc::clone(&b);
        let cancel = cancel.clone();
        tokio::spawn(async move { b.campaign_and_keep_leader(&cancel, 1).await })
    };
    wait_until_leading(&b).await;

    let current = a.get_leader(&CancellationToken::new()).await.unwrap();
    assert_eq!(current.leader, Some(Member::new(2, "b")));

    cancel.cancel();
    campaign_b.await.unwrap().unwrap();
}

/// Members looping over campaigns never lead at the same time
#[tokio::test]
async fn test_election_cluster_mutual_exclusion() -> anyhow::Result<()> {
    init_logging();

    let mut cluster = ElectionCluster::new(ElectionConfig::default()).await?;
    cluster.start();

    let first = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no leader elected");

    // force two handovers
    for _ in 0..2 {
        cluster.store().partition_keep_alive();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.store().heal_keep_alive();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(cluster.current_leaders().len() <= 1);
    }

    let report = cluster.stop().await?;
    assert!(
        report.overlapping().is_empty(),
        "overlapping leadership: {:?}",
        report.overlapping()
    );
    assert!(report.leaders().contains(&first));
    assert!(report.intervals.len() >= 2);
    assert!(report
        .intervals
        .iter()
        .any(|interval| interval.end_reason == LeadershipEnd::LeaseLapsed));
    assert_eq!(report.errors, 0);

    Ok(())
}
