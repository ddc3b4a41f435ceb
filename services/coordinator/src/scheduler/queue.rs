use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::LeaseId;
use tokio::sync::watch;
use tracing::debug;

use super::LeaseSource;
use crate::agents::Agent;
use crate::error::CoordinatorResult;
use crate::filters::Requirements;
use crate::leases::NewLease;

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub requirements: Requirements,
    pub payload: Vec<u8>,
    pub parent_id: Option<LeaseId>,
}

impl WorkItem {
    pub fn new(requirements: Requirements, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            requirements,
            payload: payload.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: LeaseId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// In-process FIFO of work items.
///
/// An agent is handed the oldest item its session can take right now.
/// Items handed out stay on record until committed, so a released lease goes
/// back to the front of the queue.
pub struct QueueLeaseSource {
    name: String,
    queue: Mutex<VecDeque<WorkItem>>,
    issued: Mutex<HashMap<LeaseId, WorkItem>>,
}

impl QueueLeaseSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, item: WorkItem) {
        lock(&self.queue).push_back(item);
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leases handed out but neither committed nor released.
    pub fn issued(&self) -> usize {
        lock(&self.issued).len()
    }
}

#[async_trait]
impl LeaseSource for QueueLeaseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assign(
        &self,
        agent: &Agent,
        cancel: watch::Receiver<bool>,
    ) -> CoordinatorResult<Option<NewLease>> {
        let Some(session) = agent.session.as_ref() else {
            return Ok(None);
        };
        if *cancel.borrow() {
            return Ok(None);
        }

        let mut queue = lock(&self.queue);
        let found = queue.iter().enumerate().find_map(|(index, item)| {
            item.requirements
                .allocate(&session.capabilities, &session.leases)
                .map(|resources| (index, resources))
        });
        let Some((index, resources)) = found else {
            return Ok(None);
        };
        let Some(item) = queue.remove(index) else {
            return Ok(None);
        };
        drop(queue);

        let lease = NewLease {
            id: LeaseId::new(),
            parent_id: item.parent_id,
            resources,
            exclusive: item.requirements.exclusive,
            payload: item.payload.clone(),
        };
        debug!(source = %self.name, lease_id = %lease.id, agent_id = %agent.id(), "Assigned queued work");
        lock(&self.issued).insert(lease.id, item);
        Ok(Some(lease))
    }

    async fn release(&self, lease: NewLease) {
        if let Some(item) = lock(&self.issued).remove(&lease.id) {
            lock(&self.queue).push_front(item);
        }
    }

    async fn commit(&self, lease: &NewLease) {
        lock(&self.issued).remove(&lease.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
