//! # Meridian KVStore
//!
//! An in-process coordination store implementing the Meridian store façade.
//!
//! ## Features
//!
//! - **Revisions**: every committed write bumps a store-wide revision and
//!   stamps keys with create/mod revisions and a version
//! - **Transactions**: compare-and-set over create revision, mod revision,
//!   version or value
//! - **Watches**: replay from a past revision, compaction notices, live events
//! - **Leases**: TTL leases renewed by keep-alive streams and expired by a
//!   background reaper that deletes the attached keys
//! - **Store leader**: a settable consensus leader id for colocation checks
//!
//! It is a single-node store for tests and embedded deployments. It gives the
//! ordering guarantees the member manager relies on, not replication.

mod lease;
pub mod store;
pub mod watch;

pub use lease::MAX_LEASE_TTL_SECS;
pub use store::{KVStore, KVStoreConfig, StoreStats};
pub use watch::WatchStats;
