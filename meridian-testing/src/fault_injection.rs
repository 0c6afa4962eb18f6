use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meridian_core::store::{
    DeleteResponse, EventType, GetOptions, GetResponse, KeepAliveStream, KeyValue, KvClient,
    LeaseClient, LeaseGrant, StoreLeaderGetter, Txn, TxnResponse, WatchClient, WatchEvent,
    WatchResponse, WatchStream,
};
use meridian_core::{LeaseId, Revision, StoreError, StoreResult, WatchId};
use meridian_kvstore::KVStore;

/// Scripted watches get ids far above anything the wrapped store hands out.
const SCRIPTED_WATCH_BASE: WatchId = 1 << 48;

/// Responses replayed by the next `watch` call instead of opening a real
/// watch.
#[derive(Debug, Clone)]
pub struct ScriptedWatch {
    pub responses: Vec<WatchResponse>,
    /// Keep the stream open after the last response until the watch is
    /// canceled
    pub hold_open: bool,
}

impl ScriptedWatch {
    /// The stream ends after the last response.
    pub fn closing(responses: Vec<WatchResponse>) -> Self {
        Self {
            responses,
            hold_open: false,
        }
    }

    /// The stream stays open after the last response.
    pub fn held(responses: Vec<WatchResponse>) -> Self {
        Self {
            responses,
            hold_open: true,
        }
    }
}

/// A compaction notice: the requested start revision is gone and the watch
/// may be restarted from `compact_revision`.
pub fn compaction_notice(compact_revision: Revision) -> WatchResponse {
    WatchResponse {
        revision: compact_revision,
        compact_revision,
        canceled: true,
        cancel_reason: Some("required revision has been compacted".to_string()),
        ..Default::default()
    }
}

/// A delete of `key` at `revision`.
pub fn delete_event(key: &str, revision: Revision) -> WatchResponse {
    WatchResponse {
        revision,
        events: vec![WatchEvent {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Bytes::new(),
                create_revision: 0,
                mod_revision: revision,
                version: 0,
                lease: None,
            },
        }],
        ..Default::default()
    }
}

/// A put of `value` under `key` at `revision`.
pub fn put_event(key: &str, value: impl Into<Bytes>, revision: Revision) -> WatchResponse {
    WatchResponse {
        revision,
        events: vec![WatchEvent {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: value.into(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease: None,
            },
        }],
        ..Default::default()
    }
}

/// A cancellation that is not caused by compaction.
pub fn watch_canceled(reason: &str) -> WatchResponse {
    WatchResponse {
        canceled: true,
        cancel_reason: Some(reason.to_string()),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_gets: bool,
    fail_deletes: bool,
    fail_txns: bool,
    fail_grants: bool,
    fail_watches: bool,
    get_delay: Option<Duration>,
    stubbed_get: Option<GetResponse>,
}

#[derive(Debug, Default)]
struct Counters {
    watches_opened: AtomicU64,
    watches_canceled: AtomicU64,
    leases_granted: AtomicU64,
    leases_revoked: AtomicU64,
    keep_alives_opened: AtomicU64,
}

/// Snapshot of what a [`FaultyStore`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub watches_opened: u64,
    pub watches_canceled: u64,
    pub leases_granted: u64,
    pub leases_revoked: u64,
    pub keep_alives_opened: u64,
}

/// A coordination store wrapper with injectable faults.
///
/// Everything not faulted is forwarded to the wrapped [`KVStore`], so
/// leases still expire and watches still fire for real.
pub struct FaultyStore {
    inner: Arc<KVStore>,
    faults: Mutex<Faults>,
    partition: Mutex<CancellationToken>,
    silence: Mutex<CancellationToken>,
    watch_scripts: Mutex<VecDeque<ScriptedWatch>>,
    held_watches: Mutex<HashMap<WatchId, mpsc::UnboundedSender<WatchResponse>>>,
    watch_starts: Mutex<Vec<Revision>>,
    counters: Counters,
}

impl FaultyStore {
    pub fn new(inner: Arc<KVStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            partition: Mutex::new(CancellationToken::new()),
            silence: Mutex::new(CancellationToken::new()),
            watch_scripts: Mutex::new(VecDeque::new()),
            held_watches: Mutex::new(HashMap::new()),
            watch_starts: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn inner(&self) -> &Arc<KVStore> {
        &self.inner
    }

    pub fn fail_gets(&self, fail: bool) {
        self.faults.lock().fail_gets = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.faults.lock().fail_deletes = fail;
    }

    pub fn fail_txns(&self, fail: bool) {
        self.faults.lock().fail_txns = fail;
    }

    pub fn fail_grants(&self, fail: bool) {
        self.faults.lock().fail_grants = fail;
    }

    pub fn fail_watches(&self, fail: bool) {
        self.faults.lock().fail_watches = fail;
    }

    /// Delay every get by `delay` before forwarding it.
    pub fn delay_gets(&self, delay: Option<Duration>) {
        self.faults.lock().get_delay = delay;
    }

    /// Answer every get with `response` instead of asking the store.
    pub fn stub_get(&self, response: Option<GetResponse>) {
        self.faults.lock().stubbed_get = response;
    }

    /// Queue a scripted watch; scripts are consumed in order, one per
    /// `watch` call.
    pub fn script_watch(&self, script: ScriptedWatch) {
        self.watch_scripts.lock().push_back(script);
    }

    /// Cut every open keep-alive stream and refuse new ones until healed.
    /// Leases are no longer renewed and expire on the store side.
    pub fn partition_keep_alive(&self) {
        info!("Partitioning keep-alive streams");
        self.partition.lock().cancel();
    }

    /// Stop renewing every lease while leaving the keep-alive streams open.
    /// Holders hear nothing at all, neither acknowledgements nor errors.
    pub fn silence_keep_alive(&self) {
        info!("Silencing keep-alive streams");
        self.silence.lock().cancel();
    }

    pub fn heal_keep_alive(&self) {
        let mut partition = self.partition.lock();
        if partition.is_cancelled() {
            info!("Healing keep-alive partition");
            *partition = CancellationToken::new();
        }
        let mut silence = self.silence.lock();
        if silence.is_cancelled() {
            info!("Healing keep-alive silence");
            *silence = CancellationToken::new();
        }
    }

    /// Start revisions of every watch opened so far, in order.
    pub fn watch_starts(&self) -> Vec<Revision> {
        self.watch_starts.lock().clone()
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            watches_opened: self.counters.watches_opened.load(Ordering::SeqCst),
            watches_canceled: self.counters.watches_canceled.load(Ordering::SeqCst),
            leases_granted: self.counters.leases_granted.load(Ordering::SeqCst),
            leases_revoked: self.counters.leases_revoked.load(Ordering::SeqCst),
            keep_alives_opened: self.counters.keep_alives_opened.load(Ordering::SeqCst),
        }
    }

    fn injected(operation: &str) -> StoreError {
        StoreError::unavailable(format!("injected {} failure", operation))
    }
}

#[async_trait]
impl KvClient for FaultyStore {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<GetResponse> {
        let (fail, delay, stubbed) = {
            let faults = self.faults.lock();
            (faults.fail_gets, faults.get_delay, faults.stubbed_get.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Self::injected("get"));
        }
        if let Some(response) = stubbed {
            return Ok(response);
        }
        self.inner.get(key, options).await
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> StoreResult<Revision> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> StoreResult<DeleteResponse> {
        let fail = self.faults.lock().fail_deletes;
        if fail {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(key).await
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        let fail = self.faults.lock().fail_txns;
        if fail {
            return Err(Self::injected("txn"));
        }
        self.inner.txn(txn).await
    }
}

#[async_trait]
impl WatchClient for FaultyStore {
    async fn watch(&self, key: &str, start_revision: Revision) -> StoreResult<WatchStream> {
        let fail = self.faults.lock().fail_watches;
        if fail {
            return Err(Self::injected("watch"));
        }
        self.watch_starts.lock().push(start_revision);

        let script = self.watch_scripts.lock().pop_front();
        let stream = match script {
            Some(script) => {
                let opened = self.counters.watches_opened.load(Ordering::SeqCst);
                let watch_id = SCRIPTED_WATCH_BASE + opened;
                let (tx, rx) = mpsc::unbounded_channel();
                for mut response in script.responses {
                    response.watch_id = watch_id;
                    let _ = tx.send(response);
                }
                if script.hold_open {
                    self.held_watches.lock().insert(watch_id, tx);
                }
                debug!("Opened scripted watch {} on {} at {}", watch_id, key, start_revision);
                WatchStream::new(watch_id, rx)
            }
            None => self.inner.watch(key, start_revision).await?,
        };

        self.counters.watches_opened.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    async fn cancel_watch(&self, watch_id: WatchId) -> StoreResult<()> {
        self.counters.watches_canceled.fetch_add(1, Ordering::SeqCst);
        if watch_id >= SCRIPTED_WATCH_BASE {
            self.held_watches.lock().remove(&watch_id);
            return Ok(());
        }
        self.inner.cancel_watch(watch_id).await
    }
}

#[async_trait]
impl LeaseClient for FaultyStore {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseGrant> {
        let fail = self.faults.lock().fail_grants;
        if fail {
            return Err(Self::injected("lease grant"));
        }
        let grant = self.inner.grant(ttl_secs).await?;
        self.counters.leases_granted.fetch_add(1, Ordering::SeqCst);
        Ok(grant)
    }

    async fn keep_alive(&self, lease_id: LeaseId) -> StoreResult<KeepAliveStream> {
        let partition = self.partition.lock().clone();
        if partition.is_cancelled() {
            return Err(StoreError::unavailable("keep-alive partitioned"));
        }

        let (tx, rx) = mpsc::channel(16);
        let silence = self.silence.lock().clone();
        if silence.is_cancelled() {
            self.counters.keep_alives_opened.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { tx.closed().await });
            return Ok(rx);
        }

        let mut upstream = self.inner.keep_alive(lease_id).await?;
        self.counters.keep_alives_opened.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let silenced = loop {
                tokio::select! {
                    biased;
                    _ = partition.cancelled() => {
                        debug!("Keep-alive for lease {} cut by partition", lease_id);
                        let _ = tx.send(Err(StoreError::unavailable("keep-alive partitioned"))).await;
                        break false;
                    }
                    _ = silence.cancelled() => {
                        debug!("Keep-alive for lease {} silenced", lease_id);
                        break true;
                    }
                    _ = tx.closed() => break false,
                    item = upstream.recv() => match item {
                        Some(item) => {
                            if tx.send(item).await.is_err() {
                                break false;
                            }
                        }
                        None => break false,
                    },
                }
            };

            // renewals stop once the upstream stream is dropped
            drop(upstream);
            if silenced {
                tx.closed().await;
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()> {
        self.counters.leases_revoked.fetch_add(1, Ordering::SeqCst);
        self.inner.revoke(lease_id).await
    }
}

impl StoreLeaderGetter for FaultyStore {
    fn leader_id(&self) -> u64 {
        self.inner.leader_id()
    }
}

/// Store-leader fake reporting a settable id.
#[derive(Debug, Default)]
pub struct PinnedLeader(AtomicU64);

impl PinnedLeader {
    pub fn new(leader_id: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(leader_id)))
    }

    pub fn set(&self, leader_id: u64) {
        self.0.store(leader_id, Ordering::SeqCst);
    }
}

impl StoreLeaderGetter for PinnedLeader {
    fn leader_id(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
