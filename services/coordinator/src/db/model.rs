//! Durable record types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fleet_id::{AgentId, LeaseId, SessionId};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Persistent configuration and state of one agent.
///
/// `update_index` is bumped by the store on every successful
/// conditioned update and is the document-level version used for CAS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDocument {
    pub id: AgentId,

    #[serde(default)]
    pub schema_version: u32,

    #[serde(default)]
    pub update_index: i64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub ephemeral: bool,

    #[serde(default)]
    pub deleted: bool,

    /// Pre-v1 single pool list.
    #[serde(default, rename = "pools", skip_serializing_if = "Vec::is_empty")]
    pub legacy_pools: Vec<String>,

    /// Pools assigned by an operator.
    #[serde(default)]
    pub explicit_pools: Vec<String>,

    /// Pools computed from the agent's reported properties.
    #[serde(default)]
    pub dynamic_pools: Vec<String>,

    #[serde(default)]
    pub enrollment_key: Option<String>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    pub session_id: Option<SessionId>,

    #[serde(default)]
    pub last_online_time: Option<DateTime<Utc>>,

    /// Agent software version reported at connect.
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub workspaces: Vec<AgentWorkspace>,

    #[serde(default)]
    pub request_conform: bool,

    #[serde(default)]
    pub request_restart: bool,

    #[serde(default)]
    pub request_shutdown: bool,

    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl AgentDocument {
    /// A freshly enrolled agent at the current schema version.
    pub fn new(id: AgentId, ephemeral: bool, now: DateTime<Utc>) -> Self {
        Self {
            id,
            schema_version: CURRENT_SCHEMA_VERSION,
            update_index: 0,
            enabled: true,
            ephemeral,
            deleted: false,
            legacy_pools: Vec::new(),
            explicit_pools: Vec::new(),
            dynamic_pools: Vec::new(),
            enrollment_key: None,
            comment: None,
            session_id: None,
            last_online_time: None,
            version: None,
            workspaces: Vec::new(),
            request_conform: false,
            request_restart: false,
            request_shutdown: false,
            created_at: now,
        }
    }

    /// Merged pool view: sorted union of explicit and dynamic pools.
    pub fn pools(&self) -> Vec<String> {
        self.explicit_pools
            .iter()
            .chain(&self.dynamic_pools)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn in_pool(&self, pool: &str) -> bool {
        self.explicit_pools.iter().any(|p| p == pool) || self.dynamic_pools.iter().any(|p| p == pool)
    }
}

/// A workspace the agent keeps synced.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentWorkspace {
    pub identifier: String,
    pub stream: String,
    #[serde(default)]
    pub view: Vec<String>,
    #[serde(default = "default_true")]
    pub incremental: bool,
}

/// Filter for [`AgentStore::find_many`](super::AgentStore::find_many).
/// Unset fields match every document.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub ephemeral: Option<bool>,
    pub deleted: Option<bool>,
    /// Matches documents last online strictly before this time. Documents
    /// that never came online are judged by `created_at`.
    pub last_online_before: Option<DateTime<Utc>>,
    pub pool: Option<String>,
    pub session_id: Option<SessionId>,
    pub limit: Option<usize>,
}

impl AgentQuery {
    pub fn matches(&self, doc: &AgentDocument) -> bool {
        self.ephemeral.is_none_or(|e| doc.ephemeral == e)
            && self.deleted.is_none_or(|d| doc.deleted == d)
            && self
                .last_online_before
                .is_none_or(|t| doc.last_online_time.unwrap_or(doc.created_at) < t)
            && self.pool.as_deref().is_none_or(|p| doc.in_pool(p))
            && self.session_id.is_none_or(|s| doc.session_id == Some(s))
    }
}

/// One past or present session of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Completed,
    Cancelled,
}

impl LeaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseOutcome::Completed => "completed",
            LeaseOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(LeaseOutcome::Completed),
            "cancelled" => Some(LeaseOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Audit record of a lease, independent of the session that ran it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub id: LeaseId,
    pub parent_id: Option<LeaseId>,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resources: BTreeMap<String, u32>,
    pub payload: Vec<u8>,
    pub outcome: Option<LeaseOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_sorted_union() {
        let mut doc = AgentDocument::new(AgentId::parse("a").unwrap(), false, Utc::now());
        doc.explicit_pools = vec!["win".into(), "linux".into()];
        doc.dynamic_pools = vec!["linux".into(), "gpu".into()];
        assert_eq!(doc.pools(), vec!["gpu", "linux", "win"]);
        assert!(doc.in_pool("gpu"));
    }

    #[test]
    fn test_v0_document_reads_legacy_pools() {
        let json = serde_json::json!({
            "id": "OLD-AGENT",
            "pools": ["a", "b"],
            "created_at": "2024-01-01T00:00:00Z",
        });
        let doc: AgentDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc.schema_version, 0);
        assert!(doc.enabled);
        assert_eq!(doc.legacy_pools, vec!["a", "b"]);
        assert!(doc.explicit_pools.is_empty());
    }

    #[test]
    fn test_query_matches_expired_ephemeral() {
        let now = Utc::now();
        let mut doc = AgentDocument::new(AgentId::parse("eph").unwrap(), true, now);
        doc.last_online_time = Some(now - chrono::TimeDelta::hours(2));
        let query = AgentQuery {
            ephemeral: Some(true),
            last_online_before: Some(now - chrono::TimeDelta::hours(1)),
            ..Default::default()
        };
        assert!(query.matches(&doc));
        doc.last_online_time = Some(now);
        assert!(!query.matches(&doc));
    }

    #[test]
    fn test_never_online_agent_ages_from_enrollment() {
        let now = Utc::now();
        let cutoff = now - chrono::TimeDelta::hours(1);
        let query = AgentQuery {
            last_online_before: Some(cutoff),
            ..Default::default()
        };
        let fresh = AgentDocument::new(AgentId::parse("new").unwrap(), true, now);
        assert!(!query.matches(&fresh));
        let abandoned =
            AgentDocument::new(AgentId::parse("old").unwrap(), true, now - chrono::TimeDelta::hours(3));
        assert!(query.matches(&abandoned));
    }
}
