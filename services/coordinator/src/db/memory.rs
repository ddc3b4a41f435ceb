//! In-memory durable store backends.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{AgentId, LeaseId, SessionId};

use super::{
    AgentDocument, AgentQuery, AgentStore, DbError, DbResult, LeaseHistoryStore, LeaseOutcome,
    LeaseRecord, SessionHistoryStore, SessionRecord,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryAgentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryAgentStore {
    docs: Mutex<HashMap<AgentId, AgentDocument>>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn find(&self, id: &AgentId) -> DbResult<Option<AgentDocument>> {
        Ok(lock(&self.docs).get(id).cloned())
    }

    async fn find_many(&self, query: &AgentQuery) -> DbResult<Vec<AgentDocument>> {
        let docs = lock(&self.docs);
        let mut matched: Vec<AgentDocument> =
            docs.values().filter(|d| query.matches(d)).cloned().collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn insert(&self, doc: &AgentDocument) -> DbResult<bool> {
        let mut docs = lock(&self.docs);
        if docs.contains_key(&doc.id) {
            return Ok(false);
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(true)
    }

    async fn find_and_update(
        &self,
        current: &AgentDocument,
        mut replacement: AgentDocument,
    ) -> DbResult<Option<AgentDocument>> {
        let mut docs = lock(&self.docs);
        let Some(stored) = docs.get_mut(&current.id) else {
            return Ok(None);
        };
        if stored.update_index != current.update_index {
            return Ok(None);
        }
        replacement.id = current.id.clone();
        replacement.update_index = current.update_index + 1;
        *stored = replacement.clone();
        Ok(Some(replacement))
    }

    async fn delete(&self, id: &AgentId) -> DbResult<bool> {
        Ok(lock(&self.docs).remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// MemorySessionHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySessionHistory {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySessionHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionHistoryStore for MemorySessionHistory {
    async fn insert(&self, record: &SessionRecord) -> DbResult<()> {
        let mut records = lock(&self.records);
        if records.iter().any(|r| r.session_id == record.session_id) {
            return Err(DbError::Duplicate {
                kind: "session",
                id: record.session_id.to_string(),
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn finish(&self, session_id: &SessionId, finished_at: DateTime<Utc>) -> DbResult<bool> {
        let mut records = lock(&self.records);
        match records
            .iter_mut()
            .find(|r| &r.session_id == session_id && r.finished_at.is_none())
        {
            Some(record) => {
                record.finished_at = Some(finished_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_agent(&self, agent_id: &AgentId, limit: usize) -> DbResult<Vec<SessionRecord>> {
        let records = lock(&self.records);
        let mut found: Vec<SessionRecord> = records
            .iter()
            .filter(|r| &r.agent_id == agent_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn delete_by_agent(&self, agent_id: &AgentId) -> DbResult<u64> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|r| &r.agent_id != agent_id);
        Ok((before - records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MemoryLeaseHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryLeaseHistory {
    records: Mutex<HashMap<LeaseId, LeaseRecord>>,
}

impl MemoryLeaseHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseHistoryStore for MemoryLeaseHistory {
    async fn insert(&self, record: &LeaseRecord) -> DbResult<()> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.id) {
            return Err(DbError::Duplicate {
                kind: "lease",
                id: record.id.to_string(),
            });
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: &LeaseId) -> DbResult<Option<LeaseRecord>> {
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn finish(
        &self,
        id: &LeaseId,
        finished_at: DateTime<Utc>,
        outcome: LeaseOutcome,
    ) -> DbResult<bool> {
        let mut records = lock(&self.records);
        match records.get_mut(id) {
            Some(record) if record.finished_at.is_none() => {
                record.finished_at = Some(finished_at);
                record.outcome = Some(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
