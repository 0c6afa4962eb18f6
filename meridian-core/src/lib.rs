//! # Meridian Core
//!
//! Shared building blocks for Meridian's lease-based leader election.
//!
//! - **Types**: member identity, revisions, lease and watch ids
//! - **Codec**: encoding of the leader record stored under the leader key
//! - **Errors**: the store error type and the member manager error taxonomy
//! - **Store façade**: the traits a coordination store implements
//!
//! The coordination store itself is consumed, not implemented, here. Any
//! store that serializes transactions, keeps revisions monotonic and expires
//! leases server-side can back the member manager.

pub mod codec;
pub mod error;
pub mod store;
pub mod types;

pub use codec::{decode_member, encode_member};
pub use error::*;
pub use store::{
    CoordinationStore, KvClient, LeaseClient, StoreLeaderGetter, WatchClient,
};
pub use types::*;
