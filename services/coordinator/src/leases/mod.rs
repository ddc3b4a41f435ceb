//! Lease lifecycle and resource accounting.
//!
//! Leases ride on the session: every lease change is a session update and
//! goes through the same tick CAS. The durable lease history is written
//! after the volatile attach and is best effort.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_id::LeaseId;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::CoordinatorSettings;
use crate::db::{LeaseHistoryStore, LeaseOutcome, LeaseRecord};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::filters::headroom;
use crate::sessions::{LeaseState, Session, SessionLease, SessionManager, SessionUpdate};
use crate::volatile::{keys, scan_set, VolatileStore};

/// A lease to attach to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLease {
    pub id: LeaseId,
    pub parent_id: Option<LeaseId>,
    pub resources: BTreeMap<String, u32>,
    pub exclusive: bool,
    pub payload: Vec<u8>,
}

impl NewLease {
    pub fn new(resources: BTreeMap<String, u32>, payload: Vec<u8>) -> Self {
        Self {
            id: LeaseId::new(),
            parent_id: None,
            resources,
            exclusive: false,
            payload,
        }
    }
}

/// A lease as the agent reports it on a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedLease {
    pub id: LeaseId,
    pub state: LeaseState,
}

/// Result of merging an agent's report into the session's lease list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseReconciliation {
    /// Lease list to store on the session.
    pub leases: Vec<SessionLease>,
    /// Leases that reached a terminal state and were dropped from the list.
    pub finished: Vec<(SessionLease, LeaseOutcome)>,
}

/// Merge the leases an agent reports into the session's current list.
///
/// - Pending leases the agent has not seen yet stay Pending.
/// - A reported Active lease becomes Active, unless it was cancelled, in
///   which case it stays Cancelled until the agent drops it.
/// - A lease reported Completed or Cancelled is finished with that outcome.
/// - A non-Pending lease missing from the report is finished: Cancelled if
///   it was Active or Cancelled, Completed if it was already Completed.
pub fn reconcile_reported(current: &[SessionLease], reported: &[ReportedLease]) -> LeaseReconciliation {
    let reported: BTreeMap<LeaseId, LeaseState> = reported.iter().map(|r| (r.id, r.state)).collect();
    let mut result = LeaseReconciliation::default();

    for lease in current {
        let outcome = match (lease.state, reported.get(&lease.id).copied()) {
            (_, Some(LeaseState::Completed)) => Some(LeaseOutcome::Completed),
            (_, Some(LeaseState::Cancelled)) => Some(LeaseOutcome::Cancelled),
            (LeaseState::Pending, None) => None,
            (LeaseState::Completed, None) => Some(LeaseOutcome::Completed),
            (LeaseState::Active | LeaseState::Cancelled, None) => Some(LeaseOutcome::Cancelled),
            (_, Some(LeaseState::Pending | LeaseState::Active)) => None,
        };

        match outcome {
            Some(outcome) => result.finished.push((lease.clone(), outcome)),
            None => {
                let mut kept = lease.clone();
                if lease.state == LeaseState::Pending
                    && reported.get(&lease.id) == Some(&LeaseState::Active)
                {
                    kept.state = LeaseState::Active;
                }
                result.leases.push(kept);
            }
        }
    }

    for id in reported.keys() {
        if !current.iter().any(|l| &l.id == id) {
            debug!(lease_id = %id, "Agent reported unknown lease");
        }
    }
    result
}

/// Creates and cancels leases and answers lease index queries.
pub struct LeaseManager {
    store: Arc<dyn VolatileStore>,
    sessions: Arc<SessionManager>,
    history: Arc<dyn LeaseHistoryStore>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        sessions: Arc<SessionManager>,
        history: Arc<dyn LeaseHistoryStore>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            sessions,
            history,
            clock,
            settings,
        }
    }

    /// Attach a Pending lease to `session`.
    ///
    /// Fails with [`CoordinatorError::Unschedulable`] if the session can
    /// never take the lease as posed, and with
    /// [`CoordinatorError::NoCapacity`] if it is too busy to take it now.
    /// Returns `None` on a lost race.
    #[instrument(skip_all, fields(session_id = %session.id, lease_id = %lease.id))]
    pub async fn create_lease(
        &self,
        session: &Session,
        lease: NewLease,
    ) -> CoordinatorResult<Option<Session>> {
        if session.lease(&lease.id).is_some() {
            return Ok(Some(session.clone()));
        }
        check_schedulable(session, &lease)?;

        let mut leases = session.leases.clone();
        leases.push(SessionLease {
            id: lease.id,
            parent_id: lease.parent_id,
            state: LeaseState::Pending,
            resources: lease.resources.clone(),
            exclusive: lease.exclusive,
            payload: lease.payload.clone(),
        });

        let Some(updated) = self
            .sessions
            .update_session(session, SessionUpdate::leases(leases))
            .await?
        else {
            return Ok(None);
        };

        let record = LeaseRecord {
            id: lease.id,
            parent_id: lease.parent_id,
            agent_id: session.agent_id.clone(),
            session_id: session.id,
            started_at: self.clock.now(),
            finished_at: None,
            resources: lease.resources,
            payload: lease.payload,
            outcome: None,
        };
        match self.history.insert(&record).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                warn!(lease_id = %record.id, "Lease history already recorded");
            }
            Err(e) => {
                warn!(lease_id = %record.id, error = %e, "Failed to record lease history");
            }
        }

        Ok(Some(updated))
    }

    /// Cancel the lease at `index`.
    ///
    /// A Pending lease is removed outright; an Active one is marked
    /// Cancelled and stops once the agent observes it.
    #[instrument(skip_all, fields(session_id = %session.id, index = index))]
    pub async fn cancel_lease(
        &self,
        session: &Session,
        index: usize,
    ) -> CoordinatorResult<Option<Session>> {
        let Some(lease) = session.leases.get(index) else {
            return Err(CoordinatorError::InvalidLeaseIndex {
                index,
                len: session.leases.len(),
            });
        };

        let mut leases = session.leases.clone();
        let removed = match lease.state {
            LeaseState::Pending => Some(leases.remove(index)),
            LeaseState::Active => {
                leases[index].state = LeaseState::Cancelled;
                None
            }
            LeaseState::Cancelled | LeaseState::Completed => return Ok(Some(session.clone())),
        };

        let Some(updated) = self
            .sessions
            .update_session(session, SessionUpdate::leases(leases))
            .await?
        else {
            return Ok(None);
        };

        if let Some(removed) = removed {
            self.record_finished(&[(removed, LeaseOutcome::Cancelled)]).await;
        }
        Ok(Some(updated))
    }

    /// Stamp finish time and outcome in the lease history.
    pub async fn record_finished(&self, finished: &[(SessionLease, LeaseOutcome)]) {
        let now = self.clock.now();
        for (lease, outcome) in finished {
            if let Err(e) = self.history.finish(&lease.id, now, *outcome).await {
                warn!(lease_id = %lease.id, error = %e, "Failed to record lease finish");
            }
        }
    }

    /// Stream the ids of every non-terminal lease.
    pub fn find_active_lease_ids(&self) -> BoxStream<'static, CoordinatorResult<LeaseId>> {
        scan_set(
            self.store.clone(),
            keys::ACTIVE_LEASES.to_string(),
            self.settings.scan_page_size,
        )
        .map_err(CoordinatorError::from)
        .and_then(|id| async move { parse_lease_id(keys::ACTIVE_LEASES, &id) })
        .boxed()
    }

    pub async fn get_child_lease_count(&self, parent: &LeaseId) -> CoordinatorResult<usize> {
        Ok(self.store.set_len(&keys::lease_children(parent)).await?)
    }

    pub async fn get_child_lease_ids(&self, parent: &LeaseId) -> CoordinatorResult<Vec<LeaseId>> {
        let key = keys::lease_children(parent);
        self.store
            .set_members(&key)
            .await?
            .iter()
            .map(|id| parse_lease_id(&key, id))
            .collect()
    }

    pub async fn get_lease_record(&self, id: &LeaseId) -> CoordinatorResult<Option<LeaseRecord>> {
        Ok(self.history.get(id).await?)
    }
}

fn check_schedulable(session: &Session, lease: &NewLease) -> CoordinatorResult<()> {
    if session.is_stopped() {
        return Err(CoordinatorError::Unschedulable(format!(
            "session {} is stopped",
            session.id
        )));
    }
    if session.leases.iter().any(|l| l.exclusive) {
        return Err(CoordinatorError::NoCapacity(format!(
            "session {} is running an exclusive lease",
            session.id
        )));
    }
    if lease.exclusive && !session.leases.is_empty() {
        return Err(CoordinatorError::NoCapacity(format!(
            "exclusive lease needs an idle session; {} has {} leases",
            session.id,
            session.leases.len()
        )));
    }
    let remaining = headroom(&session.capabilities, &session.leases);
    for (name, amount) in &lease.resources {
        let total = session.capabilities.resource(name);
        if *amount > total {
            return Err(CoordinatorError::Unschedulable(format!(
                "{name}: requested {amount}, session {} has {total}",
                session.id
            )));
        }
        let free = remaining.get(name).copied().unwrap_or(0);
        if free < i64::from(*amount) {
            return Err(CoordinatorError::NoCapacity(format!(
                "{name}: requested {amount}, {free} free on session {}",
                session.id
            )));
        }
    }
    Ok(())
}

fn parse_lease_id(key: &str, value: &str) -> CoordinatorResult<LeaseId> {
    LeaseId::parse(value).map_err(|e| CoordinatorError::corrupt(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(state: LeaseState) -> SessionLease {
        SessionLease {
            id: LeaseId::new(),
            parent_id: None,
            state,
            resources: BTreeMap::new(),
            exclusive: false,
            payload: Vec::new(),
        }
    }

    fn report(lease: &SessionLease, state: LeaseState) -> ReportedLease {
        ReportedLease { id: lease.id, state }
    }

    #[test]
    fn test_pending_survives_until_seen() {
        let pending = lease(LeaseState::Pending);
        let result = reconcile_reported(std::slice::from_ref(&pending), &[]);
        assert_eq!(result.leases, vec![pending]);
        assert!(result.finished.is_empty());
    }

    #[test]
    fn test_reported_active_promotes_pending() {
        let pending = lease(LeaseState::Pending);
        let result = reconcile_reported(
            std::slice::from_ref(&pending),
            &[report(&pending, LeaseState::Active)],
        );
        assert_eq!(result.leases[0].state, LeaseState::Active);
    }

    #[test]
    fn test_cancelled_stays_cancelled_while_agent_runs_it() {
        let cancelled = lease(LeaseState::Cancelled);
        let result = reconcile_reported(
            std::slice::from_ref(&cancelled),
            &[report(&cancelled, LeaseState::Active)],
        );
        assert_eq!(result.leases[0].state, LeaseState::Cancelled);
    }

    #[test]
    fn test_missing_active_lease_is_cancelled() {
        let active = lease(LeaseState::Active);
        let result = reconcile_reported(std::slice::from_ref(&active), &[]);
        assert!(result.leases.is_empty());
        assert_eq!(result.finished, vec![(active, LeaseOutcome::Cancelled)]);
    }

    #[test]
    fn test_reported_completion_finishes_lease() {
        let active = lease(LeaseState::Active);
        let result = reconcile_reported(
            std::slice::from_ref(&active),
            &[report(&active, LeaseState::Completed)],
        );
        assert!(result.leases.is_empty());
        assert_eq!(result.finished[0].1, LeaseOutcome::Completed);
    }
}
