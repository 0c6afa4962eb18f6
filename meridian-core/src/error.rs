//! # Error Types
//!
//! Error handling for the coordination store façade and the member manager.

use crate::{LeaseId, Revision};
use thiserror::Error;

/// Errors returned by a coordination store.
///
/// These describe failures of a single store call. The member manager and
/// the storage wrappers never hand them to callers bare; they are wrapped
/// into a [`MetaError`] kind that names the operation that failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store could not be reached or refused the request
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// The call did not complete before its deadline
    #[error("Deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    /// The caller canceled the call while it was in flight
    #[error("Request canceled: {operation}")]
    Canceled { operation: String },

    /// The referenced lease does not exist or has expired
    #[error("Lease {lease_id} not found")]
    LeaseNotFound { lease_id: LeaseId },

    /// The requested revision is older than the compaction floor
    #[error("Revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted {
        requested: Revision,
        compact_revision: Revision,
    },

    /// The requested revision has not been written yet
    #[error("Revision {requested} is a future revision (current revision {current})")]
    FutureRevision { requested: Revision, current: Revision },

    /// The request itself is malformed
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The store has been shut down
    #[error("Store is shut down")]
    Shutdown,
}

/// Result type for coordination store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Creates a new unavailable error with the given message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a deadline error for the named operation.
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Creates a cancellation error for the named operation.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns `true` for transient failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

/// Errors surfaced by the member manager and the KV storage wrappers.
///
/// Every variant that originates from a store call carries the originating
/// [`StoreError`] as its source, so the cause is never lost on the read and
/// write paths.
///
/// # Examples
///
/// ```rust
/// use meridian_core::{MetaError, StoreError};
///
/// let error = MetaError::GetLeaderFailed {
///     source: StoreError::deadline_exceeded("get leader"),
/// };
/// assert!(error.is_retryable());
///
/// let error = MetaError::MultipleLeaders { count: 2 };
/// assert!(!error.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum MetaError {
    /// Reading the leader key failed
    #[error("Failed to get leader: {source}")]
    GetLeaderFailed { source: StoreError },

    /// More than one value was found under the leader key
    #[error("Multiple leaders found: {count} values under the leader key")]
    MultipleLeaders { count: usize },

    /// The value under the leader key could not be decoded
    #[error("Invalid leader value: {reason}")]
    InvalidLeaderValue { reason: String },

    /// Deleting the leader key failed
    #[error("Failed to reset leader: {source}")]
    ResetLeaderFailed { source: StoreError },

    /// The conditional put of the leader key lost the race (`source` is
    /// `None`) or the txn call itself failed
    #[error("Failed to put leader via txn: {}", txn_failure(.source))]
    TxnPutLeaderFailed { source: Option<StoreError> },

    /// The member identity could not be encoded
    #[error("Failed to marshal member: {reason}")]
    MarshalMemberFailed { reason: String },

    /// The store refused to grant a lease
    #[error("Failed to grant lease: {source}")]
    LeaseGrantFailed { source: StoreError },

    /// A storage read failed
    #[error("Failed to get key {key}: {source}")]
    KvGetFailed { key: String, source: StoreError },

    /// A storage read returned an unexpected number of values
    #[error("Unexpected get response for key {key}: {count} values")]
    KvGetResponse { key: String, count: usize },

    /// A stored value is not valid UTF-8
    #[error("Invalid value for key {key}: {reason}")]
    KvValueInvalid { key: String, reason: String },

    /// A storage write failed
    #[error("Failed to put key {key}: {source}")]
    KvPutFailed { key: String, source: StoreError },

    /// A storage delete failed
    #[error("Failed to delete key {key}: {source}")]
    KvDeleteFailed { key: String, source: StoreError },

    /// Configuration error
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Result type for member manager and storage operations.
pub type MetaResult<T> = std::result::Result<T, MetaError>;

fn txn_failure(source: &Option<StoreError>) -> String {
    match source {
        Some(source) => source.to_string(),
        None => "leader key already exists".to_string(),
    }
}

impl MetaError {
    /// Creates the failure of a campaign that found the leader key taken.
    pub fn leader_key_taken() -> Self {
        Self::TxnPutLeaderFailed { source: None }
    }

    /// Creates a configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Determines if the failure is transient.
    ///
    /// Losing a campaign is retryable, as is any store call that timed out
    /// or could not reach the store. Invariant violations, codec failures
    /// and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TxnPutLeaderFailed { source: None } => true,
            Self::TxnPutLeaderFailed {
                source: Some(source),
            }
            | Self::GetLeaderFailed { source }
            | Self::ResetLeaderFailed { source }
            | Self::LeaseGrantFailed { source }
            | Self::KvGetFailed { source, .. }
            | Self::KvPutFailed { source, .. }
            | Self::KvDeleteFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
