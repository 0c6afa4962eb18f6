//! # Coordination Store Façade
//!
//! The minimal set of operations the member manager and the storage wrappers
//! need from a coordination store: revisioned reads, deletes, a conditional
//! transaction, key watches and leases.
//!
//! The store is expected to serialize transactions, keep revisions monotonic
//! and expire leases on its own side. Nothing here implements consensus.

use crate::{LeaseId, Revision, StoreResult, WatchId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// A key and its value together with the revision metadata the store keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the put that created the key
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Number of puts since creation
    pub version: i64,
    /// Lease the key is attached to
    pub lease: Option<LeaseId>,
}

/// Options for a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Exclusive end of a range read; a point read when `None`
    pub range_end: Option<String>,
    /// Maximum number of pairs returned, `0` for no limit
    pub limit: usize,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range_end: impl Into<String>) -> Self {
        self.range_end = Some(range_end.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Result of a read, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at which the read was served
    pub revision: Revision,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub deleted: u64,
    pub revision: Revision,
}

/// Comparison operator used by transaction conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    fn holds<T: PartialOrd>(&self, current: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => current == expected,
            CompareOp::NotEqual => current != expected,
            CompareOp::Greater => current > expected,
            CompareOp::Less => current < expected,
        }
    }
}

/// The field of a key a transaction condition inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(Bytes),
}

/// A single transaction condition.
///
/// An absent key has creation revision, mod revision and version `0` and an
/// empty value, so `create_revision(key, Equal, 0)` holds exactly when the
/// key does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// Evaluates the condition against the current state of its key.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::CreateRevision(expected) => {
                let actual = current.map_or(0, |kv| kv.create_revision);
                self.op.holds(&actual, expected)
            }
            CompareTarget::ModRevision(expected) => {
                let actual = current.map_or(0, |kv| kv.mod_revision);
                self.op.holds(&actual, expected)
            }
            CompareTarget::Version(expected) => {
                let actual = current.map_or(0, |kv| kv.version);
                self.op.holds(&actual, expected)
            }
            CompareTarget::Value(expected) => {
                let actual = current.map(|kv| kv.value.clone()).unwrap_or_default();
                self.op.holds(&actual, expected)
            }
        }
    }
}

/// A write applied by a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } => key,
            TxnOp::Delete { key } => key,
        }
    }
}

/// An atomic conditional write: if every compare holds, the `success` ops
/// are applied, otherwise the `failure` ops are.
///
/// ```rust
/// use meridian_core::store::{Compare, CompareOp, Txn, TxnOp};
///
/// let txn = Txn::new()
///     .when([Compare::create_revision("/leader", CompareOp::Equal, 0)])
///     .and_then([TxnOp::put("/leader", "me", Some(42))]);
/// assert_eq!(txn.success.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

/// Result of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held and the success branch was applied
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: Revision,
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => write!(f, "PUT"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A change to a watched key. For deletes, `kv.mod_revision` is the
/// revision of the delete and the value is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: KeyValue,
}

/// A batch of watch output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub watch_id: WatchId,
    /// Store revision when the response was produced
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    /// Non-zero when the requested start revision was compacted away;
    /// the watch is canceled and may be restarted from this revision
    pub compact_revision: Revision,
    /// The store will send nothing more on this watch
    pub canceled: bool,
    pub cancel_reason: Option<String>,
}

impl WatchResponse {
    pub fn is_compacted(&self) -> bool {
        self.compact_revision != 0
    }
}

/// Receiving side of an open watch.
#[derive(Debug)]
pub struct WatchStream {
    watch_id: WatchId,
    receiver: mpsc::UnboundedReceiver<WatchResponse>,
}

impl WatchStream {
    pub fn new(watch_id: WatchId, receiver: mpsc::UnboundedReceiver<WatchResponse>) -> Self {
        Self { watch_id, receiver }
    }

    pub fn id(&self) -> WatchId {
        self.watch_id
    }

    /// Waits for the next response; `None` once the store closed the stream.
    pub async fn message(&mut self) -> Option<WatchResponse> {
        self.receiver.recv().await
    }
}

/// A lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl_secs: i64,
}

/// Acknowledgement of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseKeepAliveResponse {
    pub id: LeaseId,
    pub ttl_secs: i64,
}

/// Stream of keep-alive acknowledgements. An `Err` item or the end of the
/// stream means the lease is no longer being renewed.
pub type KeepAliveStream = mpsc::Receiver<StoreResult<LeaseKeepAliveResponse>>;

/// Revisioned key-value operations.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<GetResponse>;

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> StoreResult<Revision>;

    async fn delete(&self, key: &str) -> StoreResult<DeleteResponse>;

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse>;
}

/// Key watches.
#[async_trait]
pub trait WatchClient: Send + Sync {
    /// Opens a watch on `key` delivering every change at or after
    /// `start_revision`; `0` watches from the next revision on.
    async fn watch(&self, key: &str, start_revision: Revision) -> StoreResult<WatchStream>;

    /// Releases a watch. Canceling an unknown watch is not an error.
    async fn cancel_watch(&self, watch_id: WatchId) -> StoreResult<()>;
}

/// Store-side TTL leases.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseGrant>;

    /// Starts renewing the lease until the returned stream is dropped.
    async fn keep_alive(&self, lease_id: LeaseId) -> StoreResult<KeepAliveStream>;

    /// Revokes the lease and deletes every key attached to it.
    async fn revoke(&self, lease_id: LeaseId) -> StoreResult<()>;
}

/// Reports the coordination store's own consensus leader.
///
/// This is a lower-level notion than the application leader elected through
/// the leader key: it is the member currently leading the store cluster.
pub trait StoreLeaderGetter: Send + Sync {
    fn leader_id(&self) -> u64;
}

/// Everything a coordination store offers.
pub trait CoordinationStore: KvClient + WatchClient + LeaseClient {}

impl<T: KvClient + WatchClient + LeaseClient + ?Sized> CoordinationStore for T {}
