use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_core::MetaError;
use meridian_kvstore::{KVStore, KVStoreConfig};
use meridian_member::{LeadershipEnd, MemberConfig, MemberManager, MemberState};

use crate::fault_injection::{FaultyStore, PinnedLeader};

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub members: usize,
    pub root_path: String,
    pub lease_ttl_secs: i64,
    pub leader_check_interval: Duration,
    pub rpc_timeout: Duration,
    /// Upper bound of the random pause between campaign attempts
    pub max_backoff: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            members: 3,
            root_path: "/meta/election".to_string(),
            lease_ttl_secs: 1,
            leader_check_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_secs(1),
            max_backoff: Duration::from_millis(30),
        }
    }
}

/// One stretch of leadership as seen by the member holding it.
#[derive(Debug, Clone)]
pub struct LeadershipInterval {
    pub member_id: u64,
    pub start: Instant,
    pub end: Instant,
    pub end_reason: LeadershipEnd,
}

impl LeadershipInterval {
    pub fn overlaps(&self, other: &LeadershipInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Default)]
pub struct ElectionReport {
    pub intervals: Vec<LeadershipInterval>,
    pub campaigns: u64,
    pub campaigns_lost: u64,
    pub errors: u64,
}

impl ElectionReport {
    /// Pairs of intervals held by different members at the same time.
    pub fn overlapping(&self) -> Vec<(LeadershipInterval, LeadershipInterval)> {
        let mut intervals = self.intervals.clone();
        intervals.sort_by_key(|interval| interval.start);

        let mut overlapping = Vec::new();
        for (i, first) in intervals.iter().enumerate() {
            for second in &intervals[i + 1..] {
                if second.start >= first.end {
                    break;
                }
                if first.member_id != second.member_id && first.overlaps(second) {
                    overlapping.push((first.clone(), second.clone()));
                }
            }
        }
        overlapping
    }

    pub fn leaders(&self) -> BTreeSet<u64> {
        self.intervals.iter().map(|i| i.member_id).collect()
    }
}

#[derive(Debug, Default)]
struct Recorder {
    intervals: Vec<LeadershipInterval>,
    campaigns: u64,
    campaigns_lost: u64,
    errors: u64,
}

/// N members campaigning for the same leader key over one shared store.
///
/// Each member runs the loop a real caller would run: campaign, and after
/// losing, wait for the current leader to go away before trying again.
/// Every member sees the store leader as itself, so only the lease decides
/// who leads.
pub struct ElectionCluster {
    config: ElectionConfig,
    store: Arc<FaultyStore>,
    managers: Vec<Arc<MemberManager>>,
    recorder: Arc<Mutex<Recorder>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ElectionCluster {
    pub async fn new(config: ElectionConfig) -> anyhow::Result<Self> {
        let inner = KVStore::new(KVStoreConfig::default())
            .await
            .context("failed to create store")?;
        let store = Arc::new(FaultyStore::new(Arc::new(inner)));

        let mut managers = Vec::with_capacity(config.members);
        for i in 1..=config.members as u64 {
            let member_config = MemberConfig::new(config.root_path.clone(), i, format!("member-{}", i))
                .with_rpc_timeout(config.rpc_timeout)
                .with_leader_check_interval(config.leader_check_interval);
            let manager = MemberManager::new(member_config, Arc::clone(&store), PinnedLeader::new(i))
                .with_context(|| format!("failed to create member {}", i))?;
            managers.push(Arc::new(manager));
        }

        Ok(Self {
            config,
            store,
            managers,
            recorder: Arc::new(Mutex::new(Recorder::default())),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn store(&self) -> &Arc<FaultyStore> {
        &self.store
    }

    pub fn managers(&self) -> &[Arc<MemberManager>] {
        &self.managers
    }

    /// Members currently leading according to their own state.
    pub fn current_leaders(&self) -> Vec<u64> {
        self.managers
            .iter()
            .filter(|m| m.is_leader())
            .map(|m| m.member().id())
            .collect()
    }

    /// Start every member's campaign loop.
    pub fn start(&mut self) {
        info!("Starting election with {} members", self.managers.len());

        for manager in &self.managers {
            let manager = Arc::clone(manager);
            let recorder = Arc::clone(&self.recorder);
            let cancel = self.cancel.child_token();
            let config = self.config.clone();

            self.tasks.push(tokio::spawn(async move {
                run_member(manager, config, recorder, cancel).await;
            }));
        }
    }

    /// Wait until some member leads, or `timeout` passes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(&leader) = self.current_leaders().first() {
                return Some(leader);
            }
            tokio::time::sleep(self.config.leader_check_interval).await;
        }
        None
    }

    /// Cancel every member and collect what happened.
    pub async fn stop(mut self) -> anyhow::Result<ElectionReport> {
        self.cancel.cancel();

        for result in join_all(self.tasks.drain(..)).await {
            result.context("member task panicked")?;
        }

        let recorder = std::mem::take(&mut *self.recorder.lock());
        Ok(ElectionReport {
            intervals: recorder.intervals,
            campaigns: recorder.campaigns,
            campaigns_lost: recorder.campaigns_lost,
            errors: recorder.errors,
        })
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

async fn run_member(
    manager: Arc<MemberManager>,
    config: ElectionConfig,
    recorder: Arc<Mutex<Recorder>>,
    cancel: CancellationToken,
) {
    let member_id = manager.member().id();

    while !cancel.is_cancelled() {
        let mut state = manager.subscribe();
        let campaign = manager.campaign_and_keep_leader(&cancel, config.lease_ttl_secs);
        tokio::pin!(campaign);

        let mut started = None;
        let result = loop {
            tokio::select! {
                result = &mut campaign => break result,
                changed = state.changed() => {
                    let leading = changed.is_ok() && *state.borrow_and_update() == MemberState::Leading;
                    if leading {
                        started = Some(Instant::now());
                    }
                }
            }
        };

        recorder.lock().campaigns += 1;
        match result {
            Ok(end_reason) => {
                let end = Instant::now();
                let start = started.unwrap_or(end);
                debug!("Member {} led for {:?}, ended by {:?}", member_id, end - start, end_reason);
                recorder.lock().intervals.push(LeadershipInterval {
                    member_id,
                    start,
                    end,
                    end_reason,
                });
            }
            Err(_) if cancel.is_cancelled() => break,
            Err(MetaError::TxnPutLeaderFailed { .. }) => {
                recorder.lock().campaigns_lost += 1;
                match manager.get_leader(&cancel).await {
                    Ok(current) if current.leader.is_some() => {
                        manager.wait_for_leader_change(&cancel, current.revision).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Member {} failed to read leader: {}", member_id, e),
                }
            }
            Err(e) => {
                recorder.lock().errors += 1;
                warn!("Member {} campaign failed: {}", member_id, e);
            }
        }

        pause(&cancel, jitter(config.max_backoff)).await;
    }
}
