//! Service-level error type.
//!
//! Lost optimistic-concurrency races are not errors: mutators return
//! `Ok(None)` for those. [`CoordinatorError::NoCapacity`] also clears up on
//! its own once leases finish. The rest are store faults, corrupt records or
//! requests that can never succeed as posed.

use fleet_id::{AgentId, SessionId};
use fleet_reconcile::ReconcileError;
use thiserror::Error;

use crate::db::DbError;
use crate::volatile::StoreError;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors surfaced by the session, filter, lease and agent services.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The volatile session store failed.
    #[error("volatile store error: {0}")]
    Store(#[from] StoreError),

    /// The durable agent store failed.
    #[error("durable store error: {0}")]
    Db(#[from] DbError),

    /// A stored blob could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A retry loop ran out of budget.
    #[error("could not apply update: {0}")]
    Exhausted(String),

    /// The request cannot be satisfied by the target session.
    #[error("unschedulable: {0}")]
    Unschedulable(String),

    /// The session could take the request but is too busy right now.
    #[error("no capacity yet: {0}")]
    NoCapacity(String),

    /// No durable document exists for the agent.
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    /// The session is not recorded in the volatile store.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The agent has no live session to operate on.
    #[error("agent {0} has no active session")]
    NoSession(AgentId),

    /// The agent was soft-deleted and must be reset before reconnecting.
    #[error("agent {0} is deleted")]
    AgentDeleted(AgentId),

    /// A lease index did not address a lease on the session.
    #[error("lease index {index} out of range ({len} leases)")]
    InvalidLeaseIndex { index: usize, len: usize },

    /// A record in the volatile store did not decode.
    #[error("corrupt record at {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<ReconcileError> for CoordinatorError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Serialization(e) => CoordinatorError::Serialization(e),
            other => CoordinatorError::Exhausted(other.to_string()),
        }
    }
}

impl CoordinatorError {
    /// Returns true if retrying against fresh state cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Unschedulable(_)
                | CoordinatorError::AgentNotFound(_)
                | CoordinatorError::AgentDeleted(_)
                | CoordinatorError::InvalidLeaseIndex { .. }
        )
    }

    pub(crate) fn corrupt(key: &str, message: impl std::fmt::Display) -> Self {
        CoordinatorError::Corrupt {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

/// Decode a JSON blob read from `key`.
pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(
    key: &str,
    json: &str,
) -> CoordinatorResult<T> {
    serde_json::from_str(json).map_err(|e| CoordinatorError::corrupt(key, e))
}
