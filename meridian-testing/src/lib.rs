//! Test utilities for Meridian leader election: a coordination store with
//! injectable faults and a multi-member election harness.

pub mod fault_injection;
pub mod scenarios;

pub use fault_injection::{
    compaction_notice, delete_event, put_event, watch_canceled, FaultStats, FaultyStore,
    PinnedLeader, ScriptedWatch,
};
pub use scenarios::{ElectionCluster, ElectionConfig, ElectionReport, LeadershipInterval};
