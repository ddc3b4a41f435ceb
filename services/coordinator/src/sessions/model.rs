//! Session, capability and lease types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fleet_id::{AgentId, LeaseId, SessionId};
use fleet_reconcile::{ContentHash, ReconcileError};
use serde::{Deserialize, Serialize};

/// Lifecycle status reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ok,
    Busy,
    Stopping,
    Stopped,
}

/// Lease state machine: Pending -> Active -> {Completed, Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Active,
    Cancelled,
    Completed,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseState::Cancelled | LeaseState::Completed)
    }

    /// A cancelled lease keeps its reservation until the agent drops it.
    pub fn reserves_resources(&self) -> bool {
        !matches!(self, LeaseState::Completed)
    }
}

/// Properties and resource counts a session reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, u32>,
}

impl Capabilities {
    pub fn new<P, R, K>(properties: P, resources: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
            resources: resources
                .into_iter()
                .map(|(name, count)| (name.into(), count))
                .collect(),
        }
    }

    pub fn hash(&self) -> Result<ContentHash, ReconcileError> {
        ContentHash::of(self)
    }

    /// Reported count of a resource, zero when absent.
    pub fn resource(&self, name: &str) -> u32 {
        self.resources.get(name).copied().unwrap_or(0)
    }
}

/// A lease attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLease {
    pub id: LeaseId,
    #[serde(default)]
    pub parent_id: Option<LeaseId>,
    pub state: LeaseState,
    #[serde(default)]
    pub resources: BTreeMap<String, u32>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, with = "payload")]
    pub payload: Vec<u8>,
}

mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Current state of one connected agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub status: SessionStatus,
    pub capabilities: Capabilities,
    pub capabilities_hash: ContentHash,
    pub leases: Vec<SessionLease>,
    /// Optimistic-concurrency version; epoch milliseconds.
    pub update_ticks: i64,
    pub expires_at: DateTime<Utc>,
    /// Filter hash to availability, for every filter the session matches.
    pub filters: BTreeMap<ContentHash, bool>,
}

impl Session {
    pub fn is_stopped(&self) -> bool {
        self.status == SessionStatus::Stopped
    }

    pub fn lease(&self, id: &LeaseId) -> Option<&SessionLease> {
        self.leases.iter().find(|l| &l.id == id)
    }
}

/// Blob persisted under the session state key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionState {
    pub agent_id: AgentId,
    pub status: SessionStatus,
    pub capabilities_hash: ContentHash,
    #[serde(default)]
    pub leases: Vec<SessionLease>,
    pub update_ticks: i64,
}

impl SessionState {
    /// `session`'s persisted fields, stamped with `update_ticks`.
    pub fn of(session: &Session, update_ticks: i64) -> Self {
        Self {
            agent_id: session.agent_id.clone(),
            status: session.status,
            capabilities_hash: session.capabilities_hash.clone(),
            leases: session.leases.clone(),
            update_ticks,
        }
    }
}

/// Requested change to a session. Unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub capabilities: Option<Capabilities>,
    pub leases: Option<Vec<SessionLease>>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn leases(leases: Vec<SessionLease>) -> Self {
        Self {
            leases: Some(leases),
            ..Self::default()
        }
    }

    pub fn stop() -> Self {
        Self::status(SessionStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_hash_ignores_order() {
        let a = Capabilities::new(["OS=Linux", "Arch=x64"], [("CPU", 8), ("RAM", 32)]);
        let b = Capabilities::new(["Arch=x64", "OS=Linux"], [("RAM", 32), ("CPU", 8)]);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_lease_payload_is_base64() {
        let lease = SessionLease {
            id: LeaseId::new(),
            parent_id: None,
            state: LeaseState::Pending,
            resources: BTreeMap::new(),
            exclusive: false,
            payload: b"job".to_vec(),
        };
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["payload"], "am9i");
        assert_eq!(json["state"], "pending");
        let back: SessionLease = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, b"job");
    }

    #[test]
    fn test_cancelled_lease_still_reserves() {
        assert!(LeaseState::Cancelled.is_terminal());
        assert!(LeaseState::Cancelled.reserves_resources());
        assert!(!LeaseState::Completed.reserves_resources());
    }
}
