use meridian_core::{leader_key, Member, MetaError, MetaResult};
use std::time::Duration;

/// How often a leading member re-checks its lease and the store leader.
pub const DEFAULT_LEADER_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Bound applied to every store call issued by the member manager.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the Member Manager
///
/// The manager takes the configuration by value at construction and never
/// changes it afterwards.
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// Logical root path; the leader key is `<root_path>/members/leader`
    pub root_path: String,

    /// Numeric id of this member
    pub id: u64,

    /// Name of this member
    pub name: String,

    /// Timeout for each store call
    pub rpc_timeout: Duration,

    /// Interval of the leadership check while leading
    pub leader_check_interval: Duration,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            root_path: "/meta".to_string(),
            id: 0,
            name: "member-0".to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            leader_check_interval: DEFAULT_LEADER_CHECK_INTERVAL,
        }
    }
}

impl MemberConfig {
    pub fn new(root_path: impl Into<String>, id: u64, name: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_leader_check_interval(mut self, interval: Duration) -> Self {
        self.leader_check_interval = interval;
        self
    }

    /// Identity this configuration campaigns with.
    pub fn member(&self) -> Member {
        Member::new(self.id, self.name.clone())
    }

    pub fn leader_key(&self) -> String {
        leader_key(&self.root_path)
    }

    pub fn validate(&self) -> MetaResult<()> {
        if self.name.is_empty() {
            return Err(MetaError::invalid_config("member name cannot be empty"));
        }
        if self.rpc_timeout.is_zero() {
            return Err(MetaError::invalid_config("rpc_timeout must be positive"));
        }
        if self.leader_check_interval.is_zero() {
            return Err(MetaError::invalid_config(
                "leader_check_interval must be positive",
            ));
        }
        Ok(())
    }
}
