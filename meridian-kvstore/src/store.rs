//! # KVStore Implementation
//!
//! A single-node revisioned key-value store implementing the coordination
//! store façade. All state sits behind one lock, so every request is applied
//! atomically and in a total order; revisions, watch delivery and lease
//! expiry follow from that order.

use crate::lease::LeaseTable;
use crate::watch::{WatchHub, WatchStats};
use async_trait::async_trait;
use bytes::Bytes;
use meridian_core::store::{
    DeleteResponse, EventType, GetOptions, GetResponse, KeepAliveStream, KeyValue, KvClient,
    LeaseClient, LeaseGrant, StoreLeaderGetter, Txn, TxnOp, TxnResponse, WatchClient, WatchEvent,
    WatchResponse, WatchStream,
};
use meridian_core::{LeaseId, Revision, StoreError, StoreResult, WatchId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the KVStore
#[derive(Debug, Clone)]
pub struct KVStoreConfig {
    /// Maximum number of keys to store
    pub max_keys: usize,
    /// Maximum key length in bytes
    pub max_key_len: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Number of events retained for watch replay before the oldest are
    /// compacted away
    pub history_limit: usize,
    /// How often expired leases are collected
    pub reaper_interval: Duration,
    /// Keep-alive streams renew every `ttl / keep_alive_divisor`
    pub keep_alive_divisor: u32,
    /// Initial consensus leader reported by the store
    pub leader_id: u64,
}

impl Default for KVStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: 1_000_000,
            max_key_len: 1024,
            max_value_size: 1024 * 1024, // 1MB
            history_limit: 10_000,
            reaper_interval: Duration::from_millis(20),
            keep_alive_divisor: 3,
            leader_id: 0,
        }
    }
}

impl KVStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_leader_id(mut self, leader_id: u64) -> Self {
        self.leader_id = leader_id;
        self
    }

    fn validate(&self) -> StoreResult<()> {
        if self.history_limit == 0 {
            return Err(StoreError::invalid_request("history_limit must be positive"));
        }
        if self.keep_alive_divisor == 0 {
            return Err(StoreError::invalid_request("keep_alive_divisor must be positive"));
        }
        if self.reaper_interval.is_zero() {
            return Err(StoreError::invalid_request("reaper_interval must be positive"));
        }
        Ok(())
    }
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub revision: Revision,
    pub compact_revision: Revision,
    pub total_keys: usize,
    pub active_leases: usize,
    pub history_len: usize,
    pub total_operations: u64,
    pub watches: WatchStats,
}

struct StoreState {
    revision: Revision,
    compact_revision: Revision,
    data: BTreeMap<String, KeyValue>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    leases: LeaseTable,
    watches: WatchHub,
    shut_down: bool,
}

impl StoreState {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 1,
            compact_revision: 0,
            data: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit,
            leases: LeaseTable::new(),
            watches: WatchHub::new(),
            shut_down: false,
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.shut_down {
            Err(StoreError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn range(&self, key: &str, options: &GetOptions) -> GetResponse {
        let mut kvs: Vec<KeyValue> = match &options.range_end {
            None => self.data.get(key).cloned().into_iter().collect(),
            Some(end) if end.as_str() <= key => Vec::new(),
            Some(end) => self
                .data
                .range::<str, _>((Bound::Included(key), Bound::Excluded(end.as_str())))
                .map(|(_, kv)| kv.clone())
                .collect(),
        };
        if options.limit > 0 {
            kvs.truncate(options.limit);
        }

        GetResponse {
            kvs,
            revision: self.revision,
        }
    }

    /// Applies a list of writes as one revision. Leases and capacity are
    /// checked up front so a request either applies fully or not at all.
    fn apply_ops(&mut self, ops: &[TxnOp], max_keys: usize) -> StoreResult<u64> {
        let mut created = BTreeSet::new();
        for op in ops {
            if let TxnOp::Put { key, lease, .. } = op {
                if let Some(lease_id) = lease {
                    if !self.leases.contains(*lease_id) {
                        return Err(StoreError::LeaseNotFound {
                            lease_id: *lease_id,
                        });
                    }
                }
                if !self.data.contains_key(key) {
                    created.insert(key.as_str());
                }
            }
        }
        if self.data.len() + created.len() > max_keys {
            return Err(StoreError::invalid_request("store is full"));
        }

        let revision = self.revision + 1;
        let mut events = Vec::new();
        let mut deleted = 0;
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.put_key(key, value.clone(), *lease, revision, &mut events)?;
                }
                TxnOp::Delete { key } => {
                    if self.delete_key(key, revision, &mut events) {
                        deleted += 1;
                    }
                }
            }
        }
        self.commit(revision, events);

        Ok(deleted)
    }

    fn put_key(
        &mut self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        revision: Revision,
        events: &mut Vec<WatchEvent>,
    ) -> StoreResult<()> {
        let (create_revision, version, old_lease) = match self.data.get(key) {
            Some(kv) => (kv.create_revision, kv.version + 1, kv.lease),
            None => (revision, 1, None),
        };
        if let Some(old) = old_lease {
            if Some(old) != lease {
                self.leases.detach(old, key);
            }
        }
        if let Some(lease_id) = lease {
            self.leases.attach(lease_id, key)?;
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: revision,
            version,
            lease,
        };
        self.data.insert(key.to_string(), kv.clone());
        events.push(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
        Ok(())
    }

    fn delete_key(&mut self, key: &str, revision: Revision, events: &mut Vec<WatchEvent>) -> bool {
        match self.data.remove(key) {
            Some(kv) => {
                if let Some(lease_id) = kv.lease {
                    self.leases.detach(lease_id, key);
                }
                events.push(WatchEvent {
                    event_type: EventType::Delete,
                    kv: KeyValue {
                        key: kv.key,
                        value: Bytes::new(),
                        create_revision: 0,
                        mod_revision: revision,
                        version: 0,
                        lease: None,
                    },
                });
                true
            }
            None => false,
        }
    }

    /// Makes a batch of events visible. A batch without events leaves the
    /// revision untouched.
    fn commit(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision = revision;
        self.watches.publish(revision, &events);
        self.history.extend(events);

        while self.history.len() > self.history_limit {
            if let Some(oldest) = self.history.pop_front() {
                self.compact_revision = self.compact_revision.max(oldest.kv.mod_revision + 1);
            }
        }
    }

    fn revoke(&mut self, lease_id: LeaseId) -> StoreResult<usize> {
        let entry = self
            .leases
            .remove(lease_id)
            .ok_or(StoreError::LeaseNotFound { lease_id })?;

        let revision = self.revision + 1;
        let mut events = Vec::new();
        for key in &entry.keys {
            self.delete_key(key, revision, &mut events);
        }
        let deleted = events.len();
        self.commit(revision, events);
        Ok(deleted)
    }

    fn expire_leases(&mut self, now: Instant) -> usize {
        let expired = self.leases.expired(now);
        for lease_id in &expired {
            match self.revoke(*lease_id) {
                Ok(deleted) => debug!("Lease {} expired, {} keys deleted", lease_id, deleted),
                Err(e) => warn!("Failed to expire lease {}: {}", lease_id, e),
            }
        }
        expired.len()
    }

    fn compact(&mut self, revision: Revision) -> StoreResult<()> {
        if revision > self.revision {
            return Err(StoreError::FutureRevision {
                requested: revision,
                current: self.revision,
            });
        }
        if revision <= self.compact_revision {
            return Err(StoreError::Compacted {
                requested: revision,
                compact_revision: self.compact_revision,
            });
        }

        self.history.retain(|ev| ev.kv.mod_revision >= revision);
        self.compact_revision = revision;
        Ok(())
    }

    fn open_watch(&mut self, key: &str, start_revision: Revision) -> WatchStream {
        let watch_id = self.watches.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();

        if start_revision > 0 && start_revision < self.compact_revision {
            // the sender is dropped here, so the stream ends after this response
            let _ = tx.send(WatchResponse {
                watch_id,
                revision: self.revision,
                compact_revision: self.compact_revision,
                canceled: true,
                cancel_reason: Some(format!(
                    "required revision {} has been compacted",
                    start_revision
                )),
                ..Default::default()
            });
            return WatchStream::new(watch_id, rx);
        }

        let start = if start_revision <= 0 {
            self.revision + 1
        } else {
            start_revision
        };
        let replay: Vec<WatchEvent> = self
            .history
            .iter()
            .filter(|ev| ev.kv.key == key && ev.kv.mod_revision >= start)
            .cloned()
            .collect();
        if !replay.is_empty() {
            let _ = tx.send(WatchResponse {
                watch_id,
                revision: self.revision,
                events: replay,
                ..Default::default()
            });
        }
        self.watches.register(watch_id, key, start, tx);

        WatchStream::new(watch_id, rx)
    }
}

/// In-process coordination store.
///
/// Besides the façade operations it offers [`KVStore::compact`] to drop old
/// history and [`KVStore::transfer_leader`] to move the consensus leader it
/// reports through [`StoreLeaderGetter`].
pub struct KVStore {
    config: KVStoreConfig,
    state: Arc<RwLock<StoreState>>,
    leader_id: AtomicU64,
    operations: AtomicU64,
    shutdown: CancellationToken,
}

impl KVStore {
    /// Create a new KVStore instance and start its lease reaper.
    pub async fn new(config: KVStoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let store = Self {
            state: Arc::new(RwLock::new(StoreState::new(config.history_limit))),
            leader_id: AtomicU64::new(config.leader_id),
            operations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            config,
        };
        store.start_reaper();

        info!("KVStore initialized with config: {:?}", store.config);
        Ok(store)
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.state.read().revision
    }

    /// Oldest revision a watch may still start from.
    pub fn compact_revision(&self) -> Revision {
        self.state.read().compact_revision
    }

    /// Discards history older than `revision`. Watches asked to start below
    /// it afterwards receive a compaction notice.
    pub fn compact(&self, revision: Revision) -> StoreResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        state.compact(revision)?;
        info!("Compacted history up to revision {}", revision);
        Ok(())
    }

    /// Moves the store's own consensus leader to `leader_id`.
    pub fn transfer_leader(&self, leader_id: u64) {
        let previous = self.leader_id.swap(leader_id, Ordering::AcqRel);
        info!("Store leader transferred from {} to {}", previous, leader_id);
    }

    /// Get store statistics
    pub fn get_stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            revision: state.revision,
            compact_revision: state.compact_revision,
            total_keys: state.data.len(),
            active_leases: state.leases.len(),
            history_len: state.history.len(),
            total_operations: self.operations.load(Ordering::Relaxed),
            watches: state.watches.stats(),
        }
    }

    /// Stops background tasks and closes every watch. Later requests fail
    /// with [`StoreError::Shutdown`].
    pub async fn shutdown(&self) {
        info!("Shutting down KVStore");
        self.shutdown.cancel();
        let mut state = self.state.write();
        state.shut_down = true;
        let revision = state.revision;
        state.watches.close_all(revision, "store shut down");
    }

    fn start_reaper(&self) {
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let period = self.config.reaper_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut guard = state.write();
                        let expired = guard.expire_leases(Instant::now());
                        let pruned = guard.watches.cleanup_closed();
                        drop(guard);
                        if expired > 0 || pruned > 0 {
                            debug!("Reaper expired {} leases, pruned {} watches", expired, pruned);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    fn validate_key(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::invalid_request("key cannot be empty"));
        }
        if key.len() > self.config.max_key_len {
            return Err(StoreError::invalid_request("key too long"));
        }
        Ok(())
    }

    fn validate_ops(&self, ops: &[TxnOp]) -> StoreResult<()> {
        for op in ops {
            self.validate_key(op.key())?;
            if let TxnOp::Put { value, .. } = op {
                if value.len() > self.config.max_value_size {
                    return Err(StoreError::invalid_request("value too large"));
                }
            }
        }
        Ok(())
    }
}

impl Drop for KVStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl KvClient for KVStore {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<GetResponse> {
        self.validate_key(key)?;
        self.record_operation();

        let state = self.state.read();
        state.ensure_open()?;
        let response = state.range(key, &options);
        debug!("GET operation: key={}, found={}", key, response.kvs.len());
        Ok(response)
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> StoreResult<Revision> {
        let ops = [TxnOp::Put {
            key: key.to_string(),
            value,
            lease,
        }];
        self.validate_ops(&ops)?;
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        state.apply_ops(&ops, self.config.max_keys)?;
        debug!("PUT operation: key={}, revision={}", key, state.revision);
        Ok(state.revision)
    }

    async fn delete(&self, key: &str) -> StoreResult<DeleteResponse> {
        self.validate_key(key)?;
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        let deleted = state.apply_ops(&[TxnOp::delete(key)], self.config.max_keys)?;
        debug!("DELETE operation: key={}, deleted={}", key, deleted);
        Ok(DeleteResponse {
            deleted,
            revision: state.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        self.validate_ops(&txn.success)?;
        self.validate_ops(&txn.failure)?;
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        let succeeded = txn
            .compares
            .iter()
            .all(|cmp| cmp.evaluate(state.data.get(&cmp.key)));
        let ops = if succeeded { &txn.success } else { &txn.failure };
        state.apply_ops(ops, self.config.max_keys)?;

        debug!("TXN operation: succeeded={}, revision={}", succeeded, state.revision);
        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
        })
    }
}

#[async_trait]
impl WatchClient for KVStore {
    async fn watch(&self, key: &str, start_revision: Revision) -> StoreResult<WatchStream> {
        self.validate_key(key)?;
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        Ok(state.open_watch(key, start_revision))
    }

    async fn cancel_watch(&self, watch_id: WatchId) -> StoreResult<()> {
        let mut state = self.state.write();
        let revision = state.revision;
        state.watches.cancel(watch_id, revision, "canceled by client");
        Ok(())
    }
}

#[async_trait]
impl LeaseClient for KVStore {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseGrant> {
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        let grant = state.leases.grant(ttl_secs, Instant::now())?;
        debug!("Lease {} granted with ttl {}s", grant.id, grant.ttl_secs);
        Ok(grant)
    }

    async fn keep_alive(&self, lease_id: LeaseId) -> StoreResult<KeepAliveStream> {
        let ttl_secs = {
            let state = self.state.read();
            state.ensure_open()?;
            state
                .leases
                .ttl_secs(lease_id)
                .ok_or(StoreError::LeaseNotFound { lease_id })?
        };
        let period = Duration::from_millis(
            ((ttl_secs.max(0) as u64).saturating_mul(1000) / u64::from(self.config.keep_alive_divisor))
                .max(10),
        );

        let (tx, rx) = mpsc::channel(16);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.child_token();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let renewed = state.write().leases.renew(lease_id, Instant::now());
                        match renewed {
                            Ok(ack) => match tx.try_send(Ok(ack)) {
                                Ok(()) | Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Closed(_)) => break,
                            },
                            Err(e) => {
                                debug!("Keep-alive for lease {} stopped: {}", lease_id, e);
                                let _ = tx.try_send(Err(e));
                                break;
                            }
                        }
                    }
                    _ = tx.closed() => break,
                    _ = shutdown.cancelled() => {
                        let _ = tx.try_send(Err(StoreError::Shutdown));
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        self.record_operation();

        let mut state = self.state.write();
        state.ensure_open()?;
        let deleted = state.revoke(lease_id)?;
        debug!("Lease {} revoked, {} keys deleted", lease_id, deleted);
        Ok(())
    }
}

impl StoreLeaderGetter for KVStore {
    fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::MAX_LEASE_TTL_SECS;
    use meridian_core::store::{Compare, CompareOp};

    async fn new_store() -> KVStore {
        KVStore::new(KVStoreConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let store = new_store().await;

        let first = store.put("key1", Bytes::from("value1"), None).await.unwrap();
        let second = store.put("key1", Bytes::from("value2"), None).await.unwrap();
        assert!(second > first);

        let response = store.get("key1", GetOptions::new()).await.unwrap();
        assert_eq!(response.kvs.len(), 1);
        let kv = &response.kvs[0];
        assert_eq!(kv.value, Bytes::from("value2"));
        assert_eq!(kv.create_revision, first);
        assert_eq!(kv.mod_revision, second);
        assert_eq!(kv.version, 2);

        let deleted = store.delete("key1").await.unwrap();
        assert_eq!(deleted.deleted, 1);
        let deleted = store.delete("key1").await.unwrap();
        assert_eq!(deleted.deleted, 0);

        let response = store.get("key1", GetOptions::new()).await.unwrap();
        assert!(response.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_keeps_revision() {
        let store = new_store().await;
        let before = store.revision();

        store.delete("missing").await.unwrap();

        assert_eq!(store.revision(), before);
    }

    #[tokio::test]
    async fn test_range_read_with_limit() {
        let store = new_store().await;
        for key in ["/a/1", "/a/2", "/a/3", "/b/1"] {
            store.put(key, Bytes::from("v"), None).await.unwrap();
        }

        let response = store
            .get("/a/", GetOptions::new().with_range("/a0"))
            .await
            .unwrap();
        let keys: Vec<&str> = response.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2", "/a/3"]);

        let response = store
            .get("/a/", GetOptions::new().with_range("/a0").with_limit(2))
            .await
            .unwrap();
        assert_eq!(response.kvs.len(), 2);
    }

    #[tokio::test]
    async fn test_txn_create_revision_guard() {
        let store = new_store().await;
        let txn = || {
            Txn::new()
                .when([Compare::create_revision("leader", CompareOp::Equal, 0)])
                .and_then([TxnOp::put("leader", "a", None)])
        };

        assert!(store.txn(txn()).await.unwrap().succeeded);
        let revision = store.revision();
        let second = store.txn(txn()).await.unwrap();
        assert!(!second.succeeded);
        assert_eq!(second.revision, revision);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = new_store().await;

        let result = store.put("k", Bytes::from("v"), Some(99)).await;

        assert_eq!(result, Err(StoreError::LeaseNotFound { lease_id: 99 }));
        assert_eq!(store.get_stats().total_keys, 0);
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = new_store().await;
        let lease = store.grant(30).await.unwrap();
        store.put("k", Bytes::from("v"), Some(lease.id)).await.unwrap();

        store.revoke(lease.id).await.unwrap();

        assert!(store.get("k", GetOptions::new()).await.unwrap().kvs.is_empty());
        assert!(store.revoke(lease.id).await.is_err());
    }

    #[tokio::test]
    async fn test_lease_expiry_deletes_key() {
        let store = new_store().await;
        let lease = store.grant(1).await.unwrap();
        store.put("k", Bytes::from("v"), Some(lease.id)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert!(store.get("k", GetOptions::new()).await.unwrap().kvs.is_empty());
        assert_eq!(store.get_stats().active_leases, 0);
    }

    #[tokio::test]
    async fn test_keep_alive_holds_lease() {
        let store = new_store().await;
        let lease = store.grant(1).await.unwrap();
        store.put("k", Bytes::from("v"), Some(lease.id)).await.unwrap();

        let mut stream = store.keep_alive(lease.id).await.unwrap();
        let ack = stream.recv().await.unwrap().unwrap();
        assert_eq!(ack.id, lease.id);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get("k", GetOptions::new()).await.unwrap().kvs.len(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.get("k", GetOptions::new()).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_grant_rejects_oversized_ttl() {
        let store = new_store().await;

        assert!(matches!(
            store.grant(i64::MAX).await,
            Err(StoreError::InvalidRequest { .. })
        ));

        let lease = store.grant(MAX_LEASE_TTL_SECS).await.unwrap();
        let mut stream = store.keep_alive(lease.id).await.unwrap();
        let ack = stream.recv().await.unwrap().unwrap();
        assert_eq!(ack.ttl_secs, MAX_LEASE_TTL_SECS);
    }

    #[tokio::test]
    async fn test_keep_alive_reports_revoked_lease() {
        let store = new_store().await;
        let lease = store.grant(1).await.unwrap();
        let mut stream = store.keep_alive(lease.id).await.unwrap();
        assert!(stream.recv().await.unwrap().is_ok());

        store.revoke(lease.id).await.unwrap();

        let mut saw_error = false;
        while let Some(item) = stream.recv().await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let store = new_store().await;
        let created = store.put("k", Bytes::from("v1"), None).await.unwrap();
        store.delete("k").await.unwrap();

        let mut stream = store.watch("k", created).await.unwrap();
        let response = stream.message().await.unwrap();

        let kinds: Vec<EventType> = response.events.iter().map(|ev| ev.event_type).collect();
        assert_eq!(kinds, vec![EventType::Put, EventType::Delete]);
    }

    #[tokio::test]
    async fn test_watch_from_now_sees_live_events() {
        let store = new_store().await;
        store.put("k", Bytes::from("old"), None).await.unwrap();

        let mut stream = store.watch("k", 0).await.unwrap();
        store.put("other", Bytes::from("x"), None).await.unwrap();
        store.put("k", Bytes::from("new"), None).await.unwrap();

        let response = stream.message().await.unwrap();
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].kv.value, Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_watch_below_compaction_floor() {
        let store = new_store().await;
        let first = store.put("k", Bytes::from("v1"), None).await.unwrap();
        let second = store.put("k", Bytes::from("v2"), None).await.unwrap();
        store.compact(second).unwrap();

        let mut stream = store.watch("k", first).await.unwrap();
        let response = stream.message().await.unwrap();
        assert!(response.canceled);
        assert_eq!(response.compact_revision, second);
        assert!(stream.message().await.is_none());

        let mut stream = store.watch("k", second).await.unwrap();
        let response = stream.message().await.unwrap();
        assert!(!response.is_compacted());
        assert_eq!(response.events[0].kv.mod_revision, second);
    }

    #[tokio::test]
    async fn test_compact_rejects_bad_revisions() {
        let store = new_store().await;
        let revision = store.put("k", Bytes::from("v"), None).await.unwrap();

        assert!(matches!(
            store.compact(revision + 10),
            Err(StoreError::FutureRevision { .. })
        ));
        store.compact(revision).unwrap();
        assert!(matches!(
            store.compact(revision),
            Err(StoreError::Compacted { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_limit_raises_compaction_floor() {
        let store = KVStore::new(KVStoreConfig::default().with_history_limit(2))
            .await
            .unwrap();
        let first = store.put("k", Bytes::from("1"), None).await.unwrap();
        store.put("k", Bytes::from("2"), None).await.unwrap();
        store.put("k", Bytes::from("3"), None).await.unwrap();

        assert_eq!(store.compact_revision(), first + 1);
        assert_eq!(store.get_stats().history_len, 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_watches() {
        let store = new_store().await;
        let mut stream = store.watch("k", 0).await.unwrap();

        store.shutdown().await;

        let last = stream.message().await.unwrap();
        assert!(last.canceled);
        assert!(stream.message().await.is_none());
        assert_eq!(
            store.get("k", GetOptions::new()).await,
            Err(StoreError::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_transfer_leader() {
        let store = KVStore::new(KVStoreConfig::default().with_leader_id(1))
            .await
            .unwrap();
        assert_eq!(store.leader_id(), 1);

        store.transfer_leader(2);
        assert_eq!(store.leader_id(), 2);
    }
}
