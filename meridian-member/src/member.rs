//! Leader campaign, leadership monitoring and leader-change watching.

use crate::config::MemberConfig;
use crate::deadline::bounded;
use crate::lease::LeaseHandle;
use bytes::Bytes;
use meridian_core::store::{
    Compare, CompareOp, CoordinationStore, EventType, GetOptions, KvClient, LeaseClient,
    StoreLeaderGetter, Txn, TxnOp, WatchClient,
};
use meridian_core::{
    decode_member, encode_member, Member, MetaError, MetaResult, Revision, StoreError, WatchId,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Role of the local member as seen by its own manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Not holding the leader key
    Follower,

    /// Lease granted, leader key not yet written
    Campaigning,

    /// Holding the leader key and renewing its lease
    Leading,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Follower => write!(f, "follower"),
            MemberState::Campaigning => write!(f, "campaigning"),
            MemberState::Leading => write!(f, "leading"),
        }
    }
}

/// Current leader as read from the store.
///
/// `leader` is `None` when no member holds the key. `revision` is the mod
/// revision of the leader key and is what
/// [`MemberManager::wait_for_leader_change`] starts watching from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetLeaderResponse {
    pub leader: Option<Member>,
    pub revision: Revision,
}

/// Why a successful campaign stopped leading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEnd {
    /// The keep-alive stream failed or ended, or the lease went a full TTL
    /// without an acknowledgement
    LeaseLapsed,

    /// The store's own leader is no longer this member
    StoreLeaderMoved,

    /// The caller canceled
    Canceled,
}

/// Statistics about campaigns run by one manager
#[derive(Debug, Default, Clone)]
pub struct MemberStats {
    pub campaigns_started: u64,
    pub campaigns_won: u64,
    pub campaigns_lost: u64,
    pub lease_lapses: u64,
    pub store_leader_moves: u64,
    pub cancellations: u64,
}

/// Member Manager runs leader election for one member over a coordination
/// store.
///
/// At most one member holds `<root_path>/members/leader` at a time. The key
/// is attached to a lease, so it disappears on its own when the holder stops
/// renewing.
pub struct MemberManager {
    config: MemberConfig,
    member: Member,
    leader_key: String,
    kv: Arc<dyn KvClient>,
    watcher: Arc<dyn WatchClient>,
    lease: Arc<dyn LeaseClient>,
    store_leader: Arc<dyn StoreLeaderGetter>,
    state: watch::Sender<MemberState>,
    stats: RwLock<MemberStats>,
}

impl MemberManager {
    /// Create a manager backed by a single store handle.
    pub fn new<S>(
        config: MemberConfig,
        store: Arc<S>,
        store_leader: Arc<dyn StoreLeaderGetter>,
    ) -> MetaResult<Self>
    where
        S: CoordinationStore + 'static,
    {
        Self::from_parts(
            config,
            store.clone(),
            store.clone(),
            store,
            store_leader,
        )
    }

    /// Create a manager from separate façade handles.
    pub fn from_parts(
        config: MemberConfig,
        kv: Arc<dyn KvClient>,
        watcher: Arc<dyn WatchClient>,
        lease: Arc<dyn LeaseClient>,
        store_leader: Arc<dyn StoreLeaderGetter>,
    ) -> MetaResult<Self> {
        config.validate()?;

        let (state, _) = watch::channel(MemberState::Follower);
        Ok(Self {
            member: config.member(),
            leader_key: config.leader_key(),
            config,
            kv,
            watcher,
            lease,
            store_leader,
            state,
            stats: RwLock::new(MemberStats::default()),
        })
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn leader_key(&self) -> &str {
        &self.leader_key
    }

    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    pub fn state(&self) -> MemberState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == MemberState::Leading
    }

    /// Subscribe to local state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MemberState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> MemberStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: MemberState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Member {} state {} -> {}", self.member, previous, state);
        }
    }

    /// Read the current leader.
    pub async fn get_leader(&self, cancel: &CancellationToken) -> MetaResult<GetLeaderResponse> {
        let response = bounded(
            cancel,
            self.config.rpc_timeout,
            "get leader",
            self.kv.get(&self.leader_key, GetOptions::new()),
        )
        .await
        .map_err(|source| MetaError::GetLeaderFailed { source })?;

        match response.kvs.as_slice() {
            [] => Ok(GetLeaderResponse::default()),
            [kv] => Ok(GetLeaderResponse {
                leader: Some(decode_member(&kv.value)?),
                revision: kv.mod_revision,
            }),
            kvs => Err(MetaError::MultipleLeaders { count: kvs.len() }),
        }
    }

    /// Delete the leader key unconditionally. Deleting an absent key
    /// succeeds.
    pub async fn reset_leader(&self, cancel: &CancellationToken) -> MetaResult<()> {
        bounded(
            cancel,
            self.config.rpc_timeout,
            "reset leader",
            self.kv.delete(&self.leader_key),
        )
        .await
        .map_err(|source| MetaError::ResetLeaderFailed { source })?;

        info!("Leader key {} reset by {}", self.leader_key, self.member);
        Ok(())
    }

    /// Run one campaign and, if won, keep leadership until it is lost or the
    /// caller cancels.
    ///
    /// Losing the campaign returns [`MetaError::TxnPutLeaderFailed`] after
    /// revoking the fresh lease. A won campaign always returns `Ok` once
    /// leadership ends. The lease is then left to expire on its own, so the
    /// key stays visible for up to `lease_ttl_secs` afterwards.
    pub async fn campaign_and_keep_leader(
        &self,
        cancel: &CancellationToken,
        lease_ttl_secs: i64,
    ) -> MetaResult<LeadershipEnd> {
        let value = encode_member(&self.member)?;

        self.stats.write().campaigns_started += 1;
        self.set_state(MemberState::Campaigning);

        let mut lease = LeaseHandle::new(
            Arc::clone(&self.lease),
            lease_ttl_secs,
            self.config.rpc_timeout,
        );
        let lease_id = match lease.grant(cancel).await {
            Ok(id) => id,
            Err(e) => {
                self.set_state(MemberState::Follower);
                return Err(e);
            }
        };

        let txn = Txn::new()
            .when([Compare::create_revision(
                self.leader_key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(
                self.leader_key.clone(),
                Bytes::from(value),
                Some(lease_id),
            )]);
        let outcome = bounded(cancel, self.config.rpc_timeout, "put leader", self.kv.txn(txn)).await;

        let failure = match outcome {
            Ok(response) if response.succeeded => None,
            Ok(_) => Some(MetaError::leader_key_taken()),
            Err(source) => Some(MetaError::TxnPutLeaderFailed {
                source: Some(source),
            }),
        };
        if let Some(failure) = failure {
            if let Err(e) = lease.close().await {
                error!("Failed to revoke lease {} after lost campaign: {}", lease_id, e);
            }
            self.stats.write().campaigns_lost += 1;
            self.set_state(MemberState::Follower);
            return Err(failure);
        }

        lease.start_keep_alive();
        self.stats.write().campaigns_won += 1;
        self.set_state(MemberState::Leading);
        info!("Member {} became leader with lease {}", self.member, lease_id);

        let end = self.keep_leader(cancel, &lease).await;

        lease.stop_keep_alive().await;
        {
            let mut stats = self.stats.write();
            match end {
                LeadershipEnd::LeaseLapsed => stats.lease_lapses += 1,
                LeadershipEnd::StoreLeaderMoved => stats.store_leader_moves += 1,
                LeadershipEnd::Canceled => stats.cancellations += 1,
            }
        }
        self.set_state(MemberState::Follower);
        info!("Member {} stopped leading: {:?}", self.member, end);

        Ok(end)
    }

    async fn keep_leader(&self, cancel: &CancellationToken, lease: &LeaseHandle) -> LeadershipEnd {
        let mut ticker = tokio::time::interval(self.config.leader_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Member {} leadership canceled by caller", self.member);
                    return LeadershipEnd::Canceled;
                }
                _ = lease.lapsed() => {
                    warn!("Member {} lost its lease, stepping down", self.member);
                    return LeadershipEnd::LeaseLapsed;
                }
                _ = ticker.tick() => {
                    if !lease.is_leader() {
                        warn!("Member {} lost its lease, stepping down", self.member);
                        return LeadershipEnd::LeaseLapsed;
                    }
                    let store_leader = self.store_leader.leader_id();
                    if store_leader != self.member.id() {
                        warn!(
                            "Store leader moved to {}, member {} stepping down",
                            store_leader, self.member
                        );
                        return LeadershipEnd::StoreLeaderMoved;
                    }
                }
            }
        }
    }

    /// Block until the leader key is deleted, the watch is canceled by the
    /// store, opening a watch fails, or the caller cancels.
    ///
    /// Watching starts at `revision`, normally the one returned by
    /// [`MemberManager::get_leader`], so a delete that happened in between is
    /// still observed.
    pub async fn wait_for_leader_change(&self, cancel: &CancellationToken, revision: Revision) {
        let mut revision = revision;

        loop {
            let opened = bounded(
                cancel,
                self.config.rpc_timeout,
                "watch leader",
                self.watcher.watch(&self.leader_key, revision),
            )
            .await;
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(StoreError::Canceled { .. }) => {
                    info!("Stopped waiting for leader change, canceled by caller");
                    return;
                }
                Err(e) => {
                    error!("Failed to watch leader key {}: {}", self.leader_key, e);
                    return;
                }
            };
            let watch_id = stream.id();

            let restart_at = loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    message = stream.message() => Some(message),
                };
                let Some(message) = message else {
                    info!("Stopped waiting for leader change, canceled by caller");
                    self.cancel_watch(watch_id).await;
                    return;
                };
                let Some(response) = message else {
                    debug!("Watch {} on leader key closed, reopening", watch_id);
                    break Some(revision);
                };

                if response.is_compacted() {
                    warn!(
                        "Watch on leader key compacted at {}, requested {}",
                        response.compact_revision, revision
                    );
                    break Some(response.compact_revision);
                }
                if response.canceled {
                    error!(
                        "Watch on leader key canceled: {}",
                        response.cancel_reason.as_deref().unwrap_or("unknown reason")
                    );
                    break None;
                }
                if response
                    .events
                    .iter()
                    .any(|ev| ev.event_type == EventType::Delete)
                {
                    info!("Leader key {} deleted", self.leader_key);
                    break None;
                }
            };

            self.cancel_watch(watch_id).await;
            match restart_at {
                Some(next) => {
                    revision = next;
                    tokio::task::yield_now().await;
                }
                None => return,
            }
        }
    }

    async fn cancel_watch(&self, watch_id: WatchId) {
        let canceled = tokio::time::timeout(
            self.config.rpc_timeout,
            self.watcher.cancel_watch(watch_id),
        )
        .await;
        match canceled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cancel watch {}: {}", watch_id, e),
            Err(_) => warn!("Timed out canceling watch {}", watch_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use meridian_kvstore::{KVStore, KVStoreConfig};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct PinnedLeader(AtomicU64);

    impl PinnedLeader {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(id)))
        }
    }

    impl StoreLeaderGetter for PinnedLeader {
        fn leader_id(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config(id: u64, name: &str) -> MemberConfig {
        MemberConfig::new("/meta/cluster0", id, name)
            .with_rpc_timeout(Duration::from_secs(1))
            .with_leader_check_interval(Duration::from_millis(20))
    }

    async fn store() -> Arc<KVStore> {
        Arc::new(KVStore::new(KVStoreConfig::default()).await.unwrap())
    }

    async fn wait_for_state(manager: &MemberManager, state: MemberState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_leader_when_empty() {
        let store = store().await;
        let manager = MemberManager::new(config(1, "a"), store, PinnedLeader::new(1)).unwrap();

        let response = manager.get_leader(&CancellationToken::new()).await.unwrap();

        assert_eq!(response, GetLeaderResponse::default());
        assert_eq!(manager.state(), MemberState::Follower);
    }

    #[tokio::test]
    async fn test_campaign_then_get_leader() {
        let store = store().await;
        let manager = Arc::new(
            MemberManager::new(config(1, "a"), store.clone(), PinnedLeader::new(1)).unwrap(),
        );
        let cancel = CancellationToken::new();
        let before = store.revision();

        let campaign = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.campaign_and_keep_leader(&cancel, 5).await })
        };
        wait_for_state(&manager, MemberState::Leading).await;

        let response = manager.get_leader(&CancellationToken::new()).await.unwrap();
        assert_eq!(response.leader, Some(Member::new(1, "a")));
        assert!(response.revision > before);

        cancel.cancel();
        let end = campaign.await.unwrap().unwrap();
        assert_eq!(end, LeadershipEnd::Canceled);
        assert_eq!(manager.state(), MemberState::Follower);
        assert_eq!(manager.stats().campaigns_won, 1);
    }

    #[tokio::test]
    async fn test_reset_leader() {
        let store = store().await;
        let manager = MemberManager::new(config(1, "a"), store.clone(), PinnedLeader::new(1)).unwrap();
        let cancel = CancellationToken::new();

        // absent key
        manager.reset_leader(&cancel).await.unwrap();

        store
            .put(manager.leader_key(), Bytes::from(encode_member(&Member::new(9, "z")).unwrap()), None)
            .await
            .unwrap();
        manager.reset_leader(&cancel).await.unwrap();

        let response = manager.get_leader(&cancel).await.unwrap();
        assert!(response.leader.is_none());
    }

    #[tokio::test]
    async fn test_lost_campaign_revokes_lease() {
        let store = store().await;
        let holder = Arc::new(
            MemberManager::new(config(1, "a"), store.clone(), PinnedLeader::new(1)).unwrap(),
        );
        let challenger =
            MemberManager::new(config(2, "b"), store.clone(), PinnedLeader::new(2)).unwrap();
        let cancel = CancellationToken::new();

        let campaign = {
            let holder = Arc::clone(&holder);
            let cancel = cancel.clone();
            tokio::spawn(async move { holder.campaign_and_keep_leader(&cancel, 5).await })
        };
        wait_for_state(&holder, MemberState::Leading).await;
        let leases_before = store.get_stats().active_leases;

        let result = challenger
            .campaign_and_keep_leader(&CancellationToken::new(), 5)
            .await;

        assert!(matches!(
            result,
            Err(MetaError::TxnPutLeaderFailed { source: None })
        ));
        assert_eq!(challenger.state(), MemberState::Follower);
        assert_eq!(challenger.stats().campaigns_lost, 1);
        assert_eq!(store.get_stats().active_leases, leases_before);

        let response = challenger.get_leader(&CancellationToken::new()).await.unwrap();
        assert_eq!(response.leader, Some(Member::new(1, "a")));

        cancel.cancel();
        campaign.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_leaves_key_until_ttl() {
        let store = store().await;
        let manager = Arc::new(
            MemberManager::new(config(1, "a"), store.clone(), PinnedLeader::new(1)).unwrap(),
        );
        let cancel = CancellationToken::new();

        let campaign = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.campaign_and_keep_leader(&cancel, 1).await })
        };
        wait_for_state(&manager, MemberState::Leading).await;

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_millis(500), campaign)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, LeadershipEnd::Canceled);

        let response = manager.get_leader(&CancellationToken::new()).await.unwrap();
        assert_eq!(response.leader, Some(Member::new(1, "a")));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let response = manager.get_leader(&CancellationToken::new()).await.unwrap();
        assert!(response.leader.is_none());
    }

    #[tokio::test]
    async fn test_store_leader_moved() {
        let store = store().await;
        let store_leader = PinnedLeader::new(1);
        let manager = Arc::new(
            MemberManager::new(config(1, "a"), store.clone(), store_leader.clone()).unwrap(),
        );

        let campaign = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .campaign_and_keep_leader(&CancellationToken::new(), 5)
                    .await
            })
        };
        wait_for_state(&manager, MemberState::Leading).await;

        store_leader.0.store(7, Ordering::SeqCst);

        let end = tokio::time::timeout(Duration::from_secs(1), campaign)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, LeadershipEnd::StoreLeaderMoved);
        assert_eq!(manager.stats().store_leader_moves, 1);
    }

    #[tokio::test]
    async fn test_wait_returns_on_delete() {
        let store = store().await;
        let manager = Arc::new(
            MemberManager::new(config(2, "b"), store.clone(), PinnedLeader::new(2)).unwrap(),
        );
        let revision = store
            .put(manager.leader_key(), Bytes::from(encode_member(&Member::new(1, "a")).unwrap()), None)
            .await
            .unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .wait_for_leader_change(&CancellationToken::new(), revision)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        manager.reset_leader(&CancellationToken::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_sees_delete_before_watch() {
        let store = store().await;
        let manager = MemberManager::new(config(2, "b"), store.clone(), PinnedLeader::new(2)).unwrap();
        let revision = store
            .put(manager.leader_key(), Bytes::from(encode_member(&Member::new(1, "a")).unwrap()), None)
            .await
            .unwrap();
        manager.reset_leader(&CancellationToken::new()).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(1),
            manager.wait_for_leader_change(&CancellationToken::new(), revision),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_restarts_after_compaction() {
        let store = store().await;
        let manager = Arc::new(
            MemberManager::new(config(2, "b"), store.clone(), PinnedLeader::new(2)).unwrap(),
        );
        let revision = store
            .put(manager.leader_key(), Bytes::from(encode_member(&Member::new(1, "a")).unwrap()), None)
            .await
            .unwrap();
        for i in 0..5 {
            store.put(&format!("/other/{}", i), Bytes::from("x"), None).await.unwrap();
        }
        store.compact(store.revision()).unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .wait_for_leader_change(&CancellationToken::new(), revision)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        manager.reset_leader(&CancellationToken::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_honors_cancellation() {
        let store = store().await;
        let manager = MemberManager::new(config(2, "b"), store.clone(), PinnedLeader::new(2)).unwrap();
        let cancel = CancellationToken::new();

        let waiter = manager.wait_for_leader_change(&cancel, store.revision());
        let canceler = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(waiter, canceler);
        })
        .await
        .unwrap();
        assert_eq!(store.get_stats().watches.active_watches, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        tokio_test::block_on(async {
            let store = store().await;
            let result = MemberManager::new(
                MemberConfig::new("/meta", 1, ""),
                store,
                PinnedLeader::new(1),
            );
            assert!(matches!(result, Err(MetaError::InvalidConfig { .. })));
        });
    }
}
