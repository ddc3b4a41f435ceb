//! Key layout in the volatile store.

use fleet_id::{LeaseId, SessionId};
use fleet_reconcile::ContentHash;

/// Hash of live session id to its current update-tick.
pub const SESSIONS: &str = "sessions";

/// Hash of filter requirements hash to last-touch tick.
pub const FILTERS: &str = "filters";

/// Set of lease ids not yet in a terminal state.
pub const ACTIVE_LEASES: &str = "leases:active";

/// Channel carrying the id of every session whose visible state changed.
pub const SESSION_UPDATES: &str = "sessions:updates";

/// Serialized session state blob.
pub fn session_state(id: &SessionId) -> String {
    format!("session:{id}:state")
}

/// Serialized capabilities reported by the session.
pub fn session_capabilities(id: &SessionId) -> String {
    format!("session:{id}:capabilities")
}

/// Hash of filter hash to "1" (available) or "0" (potential only).
pub fn session_filters(id: &SessionId) -> String {
    format!("session:{id}:filters")
}

pub fn filter_requirements(hash: &ContentHash) -> String {
    format!("filter:{hash}:requirements")
}

pub fn filter_available(hash: &ContentHash) -> String {
    format!("filter:{hash}:available")
}

pub fn filter_potential(hash: &ContentHash) -> String {
    format!("filter:{hash}:potential")
}

/// Set of child lease ids registered under a parent lease.
pub fn lease_children(parent: &LeaseId) -> String {
    format!("lease:{parent}:children")
}
