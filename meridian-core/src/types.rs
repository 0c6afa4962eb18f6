//! # Core Types
//!
//! Identity and revision types shared by every Meridian crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-wide, monotonically increasing version number.
///
/// Every mutation applied by the coordination store bumps the revision.
/// A revision of `0` means "never written" when it appears as a key's
/// creation revision, and "from now on" when passed as a watch start.
pub type Revision = i64;

/// Identifier of a lease granted by the coordination store.
pub type LeaseId = i64;

/// Identifier of an open watch on the coordination store.
pub type WatchId = u64;

/// Identity of a cluster member.
///
/// A member is identified by a numeric id and a human readable name. Both
/// are fixed at construction; the type exposes no mutators so an identity
/// can be shared freely between tasks.
///
/// # Examples
///
/// ```rust
/// use meridian_core::Member;
///
/// let member = Member::new(7, "node-a");
/// assert_eq!(member.id(), 7);
/// assert_eq!(member.name(), "node-a");
/// assert_eq!(member.to_string(), "node-a(7)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    id: u64,
    name: String,
}

impl Member {
    /// Creates a new member identity.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Returns the numeric id of this member.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the name of this member.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Formats the leader key for the given root path.
///
/// ```rust
/// use meridian_core::leader_key;
///
/// assert_eq!(leader_key("/meta"), "/meta/members/leader");
/// ```
pub fn leader_key(root_path: &str) -> String {
    format!("{}/members/leader", root_path)
}
