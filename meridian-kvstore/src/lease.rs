//! Lease bookkeeping for the in-process store.

use meridian_core::store::{LeaseGrant, LeaseKeepAliveResponse};
use meridian_core::{LeaseId, StoreError, StoreResult};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Longest TTL a lease may be granted with.
pub const MAX_LEASE_TTL_SECS: i64 = 9_000_000_000;

#[derive(Debug)]
pub(crate) struct LeaseEntry {
    pub(crate) ttl_secs: i64,
    pub(crate) deadline: Instant,
    pub(crate) keys: BTreeSet<String>,
}

impl LeaseEntry {
    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(0) as u64)
    }
}

fn deadline_after(now: Instant, ttl: Duration) -> StoreResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::invalid_request(format!("lease ttl {:?} overflows the clock", ttl)))
}

/// Granted leases and the keys attached to each of them.
#[derive(Debug)]
pub(crate) struct LeaseTable {
    leases: HashMap<LeaseId, LeaseEntry>,
    next_id: LeaseId,
}

impl LeaseTable {
    pub(crate) fn new() -> Self {
        Self {
            leases: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn grant(&mut self, ttl_secs: i64, now: Instant) -> StoreResult<LeaseGrant> {
        if ttl_secs <= 0 {
            return Err(StoreError::invalid_request(format!(
                "lease ttl must be positive, got {}",
                ttl_secs
            )));
        }
        if ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(StoreError::invalid_request(format!(
                "lease ttl {} exceeds the maximum of {}",
                ttl_secs, MAX_LEASE_TTL_SECS
            )));
        }
        let deadline = deadline_after(now, Duration::from_secs(ttl_secs as u64))?;

        let id = self.next_id;
        self.next_id += 1;
        self.leases.insert(
            id,
            LeaseEntry {
                ttl_secs,
                deadline,
                keys: BTreeSet::new(),
            },
        );

        Ok(LeaseGrant { id, ttl_secs })
    }

    /// Pushes the deadline of a live lease one TTL into the future.
    pub(crate) fn renew(&mut self, lease_id: LeaseId, now: Instant) -> StoreResult<LeaseKeepAliveResponse> {
        match self.leases.get_mut(&lease_id) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = deadline_after(now, entry.ttl())?;
                Ok(LeaseKeepAliveResponse {
                    id: lease_id,
                    ttl_secs: entry.ttl_secs,
                })
            }
            _ => Err(StoreError::LeaseNotFound { lease_id }),
        }
    }

    pub(crate) fn ttl_secs(&self, lease_id: LeaseId) -> Option<i64> {
        self.leases.get(&lease_id).map(|entry| entry.ttl_secs)
    }

    pub(crate) fn contains(&self, lease_id: LeaseId) -> bool {
        self.leases.contains_key(&lease_id)
    }

    pub(crate) fn attach(&mut self, lease_id: LeaseId, key: &str) -> StoreResult<()> {
        let entry = self
            .leases
            .get_mut(&lease_id)
            .ok_or(StoreError::LeaseNotFound { lease_id })?;
        entry.keys.insert(key.to_string());
        Ok(())
    }

    pub(crate) fn detach(&mut self, lease_id: LeaseId, key: &str) {
        if let Some(entry) = self.leases.get_mut(&lease_id) {
            entry.keys.remove(key);
        }
    }

    pub(crate) fn remove(&mut self, lease_id: LeaseId) -> Option<LeaseEntry> {
        self.leases.remove(&lease_id)
    }

    /// Leases whose deadline has passed.
    pub(crate) fn expired(&self, now: Instant) -> Vec<LeaseId> {
        let mut expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.leases.len()
    }
}
