use fleet_id::{AgentId, SessionId};

use crate::db::AgentDocument;
use crate::leases::ReportedLease;
use crate::sessions::{Capabilities, Session, SessionStatus};

/// Coherent view of an agent: its durable document plus the live session
/// the document points at, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub document: AgentDocument,
    pub session: Option<Session>,
}

impl Agent {
    pub fn id(&self) -> &AgentId {
        &self.document.id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Connected with a session that is not stopped.
    pub fn is_online(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_stopped())
    }

    /// Online, enabled, and reporting itself ready for work.
    pub fn is_schedulable(&self) -> bool {
        self.document.enabled
            && !self.document.deleted
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.status == SessionStatus::Ok)
    }
}

/// What an agent reports on a heartbeat. Unset fields are unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub status: Option<SessionStatus>,
    pub capabilities: Option<Capabilities>,
    pub leases: Option<Vec<ReportedLease>>,
    pub dynamic_pools: Option<Vec<String>>,
}

/// Operator-controlled settings. Unset fields are unchanged.
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub enabled: Option<bool>,
    pub explicit_pools: Option<Vec<String>>,
    pub comment: Option<Option<String>>,
    pub enrollment_key: Option<Option<String>>,
    pub request_conform: Option<bool>,
    pub request_restart: Option<bool>,
    pub request_shutdown: Option<bool>,
}

impl AgentSettings {
    /// Apply to a document. Returns `true` if anything changed.
    pub(crate) fn apply(&self, doc: &mut AgentDocument) -> bool {
        let before = doc.clone();
        if let Some(enabled) = self.enabled {
            doc.enabled = enabled;
        }
        if let Some(pools) = &self.explicit_pools {
            doc.explicit_pools = super::migrate::normalize_pools(pools.iter().cloned());
        }
        if let Some(comment) = &self.comment {
            doc.comment = comment.clone();
        }
        if let Some(key) = &self.enrollment_key {
            doc.enrollment_key = key.clone();
        }
        if let Some(flag) = self.request_conform {
            doc.request_conform = flag;
        }
        if let Some(flag) = self.request_restart {
            doc.request_restart = flag;
        }
        if let Some(flag) = self.request_shutdown {
            doc.request_shutdown = flag;
        }
        *doc != before
    }
}
