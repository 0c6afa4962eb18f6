//! # Meridian Member
//!
//! Lease-based leader election for Meridian members.
//!
//! This crate provides functionality for:
//! - Campaigning for the leader key with a compare-and-set transaction
//! - Keeping the leader lease alive and stepping down when it lapses
//! - Stepping down when the coordination store's own leader moves away
//! - Watching the leader key until the current leader goes away
//!
//! Retrying a lost campaign is left to the caller. A typical loop reads the
//! leader with [`MemberManager::get_leader`], waits with
//! [`MemberManager::wait_for_leader_change`] while someone else holds the key
//! and campaigns again once it is gone.

pub mod config;
mod deadline;
mod lease;
pub mod member;

pub use config::{MemberConfig, DEFAULT_LEADER_CHECK_INTERVAL, DEFAULT_RPC_TIMEOUT};
pub use member::{GetLeaderResponse, LeadershipEnd, MemberManager, MemberState, MemberStats};
