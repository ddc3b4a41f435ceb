use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{AgentId, SessionId};
use fleet_reconcile::retry_until_applied;
use futures_util::TryStreamExt;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::migrate::{needs_upgrade, normalize_pools, upgrade_step};
use super::model::{Agent, AgentSettings, SessionReport};
use crate::clock::{to_delta, Clock};
use crate::config::CoordinatorSettings;
use crate::db::{AgentDocument, AgentQuery, AgentWorkspace, DurableStore, LeaseOutcome, SessionRecord};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::leases::{reconcile_reported, LeaseManager, NewLease};
use crate::scheduler::LeaseArbiter;
use crate::sessions::{Capabilities, Session, SessionLease, SessionManager, SessionStatus, SessionUpdate};

/// Reconciles durable agent documents with their live sessions.
///
/// Every `try_*` mutator takes an [`Agent`] read by [`AgentService::resolve`],
/// computes its delta from that read and applies it with conditioned writes.
/// `Ok(None)` means a write lost a race: re-resolve and try again.
pub struct AgentService {
    sessions: Arc<SessionManager>,
    leases: Arc<LeaseManager>,
    durable: DurableStore,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl AgentService {
    pub fn new(
        sessions: Arc<SessionManager>,
        leases: Arc<LeaseManager>,
        durable: DurableStore,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            sessions,
            leases,
            durable,
            clock,
            settings,
        }
    }

    /// Load an agent and its live session.
    ///
    /// Stale documents are upgraded one schema version per conditioned write.
    /// A session pointer that is dangling, points at another agent's session,
    /// or at a stopped session is cleared before the agent is returned.
    #[instrument(skip(self))]
    pub async fn resolve(&self, id: &AgentId) -> CoordinatorResult<Option<Agent>> {
        retry_until_applied("resolve agent", &self.settings.retry, || self.resolve_once(id)).await
    }

    /// One resolve attempt. The outer `None` asks for another pass.
    async fn resolve_once(&self, id: &AgentId) -> CoordinatorResult<Option<Option<Agent>>> {
        let Some(document) = self.durable.agents.find(id).await? else {
            return Ok(Some(None));
        };

        if needs_upgrade(&document) {
            let from = document.schema_version;
            let next = upgrade_step(document.clone());
            if self.durable.agents.find_and_update(&document, next).await?.is_some() {
                info!(agent_id = %id, from, "Upgraded agent document");
            }
            return Ok(None);
        }

        let Some(session_id) = document.session_id else {
            return Ok(Some(Some(Agent {
                document,
                session: None,
            })));
        };

        let session = self.sessions.get_session(&session_id).await?;
        let owned = session.as_ref().is_none_or(|s| s.agent_id == document.id);
        match session {
            Some(session) if owned && !session.is_stopped() => Ok(Some(Some(Agent {
                document,
                session: Some(session),
            }))),
            _ => {
                let mut healed = document.clone();
                healed.session_id = None;
                if self.durable.agents.find_and_update(&document, healed).await?.is_some() {
                    info!(agent_id = %id, session_id = %session_id, "Cleared stale session reference");
                    // Another agent's session keeps its history open.
                    if owned {
                        self.finish_session_history(&session_id).await;
                    }
                }
                Ok(None)
            }
        }
    }

    /// Resolve every agent whose document matches `query`.
    pub async fn find(&self, query: &AgentQuery) -> CoordinatorResult<Vec<Agent>> {
        let documents = self.durable.agents.find_many(query).await?;
        let mut agents = Vec::with_capacity(documents.len());
        for document in documents {
            if let Some(agent) = self.resolve(&document.id).await? {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    /// Enroll a new agent. Returns `None` if the id is already taken.
    #[instrument(skip(self, enrollment_key))]
    pub async fn try_create_agent(
        &self,
        id: AgentId,
        ephemeral: bool,
        enrollment_key: Option<String>,
    ) -> CoordinatorResult<Option<Agent>> {
        let mut document = AgentDocument::new(id, ephemeral, self.clock.now());
        document.enrollment_key = enrollment_key;
        if !self.durable.agents.insert(&document).await? {
            debug!(agent_id = %document.id, "Agent already enrolled");
            return Ok(None);
        }
        info!(agent_id = %document.id, ephemeral, "Agent enrolled");
        Ok(Some(Agent {
            document,
            session: None,
        }))
    }

    /// Start a new session for `agent`, stopping any session it still has.
    ///
    /// The new session is deleted again if the document no longer matches
    /// `agent`, so a lost race leaves nothing behind.
    #[instrument(skip_all, fields(agent_id = %agent.id(), session_id = %session_id))]
    pub async fn try_create_session(
        &self,
        agent: &Agent,
        session_id: SessionId,
        capabilities: Capabilities,
        version: Option<String>,
    ) -> CoordinatorResult<Option<Agent>> {
        if agent.document.deleted {
            return Err(CoordinatorError::AgentDeleted(agent.id().clone()));
        }

        if let Some(previous) = &agent.session {
            if self.stop_session(previous).await?.is_none() {
                return Ok(None);
            }
        }

        let Some(session) = self
            .sessions
            .create_session(agent.id(), session_id, capabilities)
            .await?
        else {
            return Ok(None);
        };

        let now = self.clock.now();
        let mut next = agent.document.clone();
        next.session_id = Some(session.id);
        next.last_online_time = Some(now);
        next.version = version.clone();

        let Some(document) = self.durable.agents.find_and_update(&agent.document, next).await? else {
            debug!("Agent document changed, rolling back new session");
            match self.sessions.delete_session(&session).await {
                Ok(true) => {}
                Ok(false) => warn!("New session changed before rollback"),
                Err(e) => warn!(error = %e, "Failed to roll back new session"),
            }
            return Ok(None);
        };

        if let Some(previous) = &agent.session {
            self.finish_session_history(&previous.id).await;
        }
        let record = SessionRecord {
            session_id: session.id,
            agent_id: agent.id().clone(),
            started_at: now,
            finished_at: None,
            version,
        };
        if let Err(e) = self.durable.sessions.insert(&record).await {
            warn!(error = %e, "Failed to record session history");
        }

        Ok(Some(Agent {
            document,
            session: Some(session),
        }))
    }

    /// Apply an agent's heartbeat report.
    ///
    /// Reporting `Stopped` ends the session and detaches it from the agent.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn try_update_session(
        &self,
        agent: &Agent,
        report: SessionReport,
    ) -> CoordinatorResult<Option<Agent>> {
        let Some(session) = agent.session.as_ref() else {
            return Err(CoordinatorError::NoSession(agent.id().clone()));
        };

        let (leases, mut finished) = match &report.leases {
            Some(reported) => {
                let merged = reconcile_reported(&session.leases, reported);
                (Some(merged.leases), merged.finished)
            }
            None => (None, Vec::new()),
        };
        let stopping = report.status == Some(SessionStatus::Stopped);
        if stopping {
            let remaining = leases.as_deref().unwrap_or(&session.leases);
            finished.extend(cancel_all(remaining));
        }

        let update = SessionUpdate {
            status: report.status,
            capabilities: report.capabilities,
            leases,
        };
        let Some(updated) = self.sessions.update_session(session, update).await? else {
            return Ok(None);
        };
        self.leases.record_finished(&finished).await;

        let now = self.clock.now();
        let mut next = agent.document.clone();
        if stopping {
            next.session_id = None;
            next.last_online_time = Some(now);
        } else {
            let refresh_due = next.last_online_time.is_none_or(|seen| {
                now - seen >= to_delta(self.settings.online_refresh_interval)
            });
            if refresh_due {
                next.last_online_time = Some(now);
            }
        }
        if let Some(pools) = report.dynamic_pools {
            next.dynamic_pools = normalize_pools(pools);
        }

        let document = if next == agent.document {
            agent.document.clone()
        } else {
            match self.durable.agents.find_and_update(&agent.document, next).await? {
                Some(document) => document,
                // The session update already applied; pick up whoever changed the document.
                None => self
                    .durable
                    .agents
                    .find(agent.id())
                    .await?
                    .ok_or_else(|| CoordinatorError::AgentNotFound(agent.id().clone()))?,
            }
        };

        if stopping {
            self.finish_session_history(&session.id).await;
            return Ok(Some(Agent {
                document,
                session: None,
            }));
        }
        Ok(Some(Agent {
            document,
            session: Some(updated),
        }))
    }

    /// Apply operator settings. Long-polling agents are woken so they see
    /// request flags promptly.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn try_update_settings(
        &self,
        agent: &Agent,
        settings: &AgentSettings,
    ) -> CoordinatorResult<Option<Agent>> {
        let mut next = agent.document.clone();
        if !settings.apply(&mut next) {
            return Ok(Some(agent.clone()));
        }
        self.replace_document(agent, next).await
    }

    /// Replace the workspaces the agent should keep synced.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn try_update_workspaces(
        &self,
        agent: &Agent,
        mut workspaces: Vec<AgentWorkspace>,
        request_conform: bool,
    ) -> CoordinatorResult<Option<Agent>> {
        workspaces.sort();
        workspaces.dedup();
        let mut next = agent.document.clone();
        next.workspaces = workspaces;
        next.request_conform |= request_conform;
        if next == agent.document {
            return Ok(Some(agent.clone()));
        }
        self.replace_document(agent, next).await
    }

    /// Soft-delete the agent, stopping its session first.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn try_delete(&self, agent: &Agent) -> CoordinatorResult<Option<Agent>> {
        if let Some(session) = &agent.session {
            if self.stop_session(session).await?.is_none() {
                return Ok(None);
            }
        }

        let mut next = agent.document.clone();
        next.deleted = true;
        next.enabled = false;
        next.session_id = None;
        let Some(document) = self.durable.agents.find_and_update(&agent.document, next).await? else {
            return Ok(None);
        };

        if let Some(session) = &agent.session {
            self.finish_session_history(&session.id).await;
        }
        info!("Agent deleted");
        Ok(Some(Agent {
            document,
            session: None,
        }))
    }

    /// Bring a deleted or wedged agent back to a clean enrolled state.
    ///
    /// Any live session is stopped; request flags and the deleted flag are
    /// cleared. Pools, workspaces and the enrollment key are kept.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn try_reset(&self, agent: &Agent) -> CoordinatorResult<Option<Agent>> {
        if let Some(session) = &agent.session {
            if self.stop_session(session).await?.is_none() {
                return Ok(None);
            }
        }

        let mut next = agent.document.clone();
        next.deleted = false;
        next.enabled = true;
        next.session_id = None;
        next.request_conform = false;
        next.request_restart = false;
        next.request_shutdown = false;
        let Some(document) = self.durable.agents.find_and_update(&agent.document, next).await? else {
            return Ok(None);
        };

        if let Some(session) = &agent.session {
            self.finish_session_history(&session.id).await;
        }
        info!("Agent reset");
        Ok(Some(Agent {
            document,
            session: None,
        }))
    }

    /// Attach a new Pending lease to the agent's session.
    #[instrument(skip_all, fields(agent_id = %agent.id(), lease_id = %lease.id))]
    pub async fn try_create_lease(
        &self,
        agent: &Agent,
        lease: NewLease,
    ) -> CoordinatorResult<Option<Agent>> {
        if !agent.document.enabled || agent.document.deleted {
            return Err(CoordinatorError::Unschedulable(format!(
                "agent {} is disabled",
                agent.id()
            )));
        }
        let session = self.live_session(agent)?;
        let updated = self.leases.create_lease(session, lease).await?;
        Ok(updated.map(|session| Agent {
            document: agent.document.clone(),
            session: Some(session),
        }))
    }

    /// Cancel the lease at `index` on the agent's session.
    #[instrument(skip_all, fields(agent_id = %agent.id(), index = index))]
    pub async fn try_cancel_lease(
        &self,
        agent: &Agent,
        index: usize,
    ) -> CoordinatorResult<Option<Agent>> {
        let session = self.live_session(agent)?;
        let updated = self.leases.cancel_lease(session, index).await?;
        Ok(updated.map(|session| Agent {
            document: agent.document.clone(),
            session: Some(session),
        }))
    }

    /// Long-poll for a change to the agent's session, then re-resolve.
    ///
    /// An agent without a session has nothing to wake on and sleeps for the
    /// full `timeout`.
    pub async fn wait_for_update(
        &self,
        agent: &Agent,
        timeout: Duration,
    ) -> CoordinatorResult<Option<Agent>> {
        match &agent.session {
            Some(session) => {
                self.sessions.wait_for_session_update(session, timeout).await?;
            }
            None => sleep(timeout).await,
        }
        self.resolve(agent.id()).await
    }

    /// Wait up to `timeout` for one of the arbiter's sources to hand the
    /// agent work, and attach it.
    ///
    /// Returns the agent with the new lease attached, or `None` if no work
    /// was attached before the deadline.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn wait_for_lease(
        &self,
        arbiter: &LeaseArbiter,
        agent: &Agent,
        timeout: Duration,
    ) -> CoordinatorResult<Option<Agent>> {
        let deadline = Instant::now() + timeout;
        let mut agent = agent.clone();

        loop {
            if agent.is_schedulable() {
                if let Some(grant) = arbiter.assign(&agent).await {
                    match self.try_create_lease(&agent, grant.lease.clone()).await {
                        Ok(Some(updated)) => {
                            info!(
                                lease_id = %grant.lease.id,
                                source = arbiter.source_name(&grant),
                                "Lease assigned"
                            );
                            arbiter.commit(&grant).await;
                            return Ok(Some(updated));
                        }
                        Ok(None) => {
                            debug!("Lease attach lost a race");
                            arbiter.release(grant).await;
                            agent = self
                                .resolve(agent.id())
                                .await?
                                .ok_or_else(|| CoordinatorError::AgentNotFound(agent.id().clone()))?;
                            continue;
                        }
                        Err(CoordinatorError::NoCapacity(reason)) => {
                            debug!(%reason, "Session is full, waiting for capacity");
                            arbiter.release(grant).await;
                        }
                        Err(e) => {
                            arbiter.release(grant).await;
                            return Err(e);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(poll) = arbiter.poll_interval() {
                wait = wait.min(poll);
            }
            let refreshed = match timeout_at(deadline, self.wait_for_update(&agent, wait)).await {
                Ok(refreshed) => refreshed?,
                Err(_) => return Ok(None),
            };
            agent = refreshed.ok_or_else(|| CoordinatorError::AgentNotFound(agent.id().clone()))?;
        }
    }

    /// Stop sessions past their expiry window and finalise sessions whose
    /// stop grace period has also run out.
    ///
    /// Returns the number of sessions handled.
    #[instrument(skip(self))]
    pub async fn terminate_expired_sessions(&self) -> CoordinatorResult<usize> {
        let mut expired = self.sessions.find_expired_sessions();
        let mut handled = 0;
        while let Some(session) = expired.try_next().await? {
            match self.terminate_session(&session).await {
                Ok(true) => handled += 1,
                Ok(false) => debug!(session_id = %session.id, "Expired session changed, skipping"),
                Err(e) => {
                    error!(session_id = %session.id, error = %e, "Failed to terminate expired session")
                }
            }
        }
        if handled > 0 {
            info!(handled, "Terminated expired sessions");
        }
        Ok(handled)
    }

    async fn terminate_session(&self, session: &Session) -> CoordinatorResult<bool> {
        if session.is_stopped() {
            if !self.sessions.delete_session(session).await? {
                return Ok(false);
            }
            info!(session_id = %session.id, agent_id = %session.agent_id, "Session finalised");
        } else {
            if self.stop_session(session).await?.is_none() {
                return Ok(false);
            }
            info!(session_id = %session.id, agent_id = %session.agent_id, "Session expired");
        }

        self.detach_session(&session.agent_id, &session.id).await?;
        self.finish_session_history(&session.id).await;
        Ok(true)
    }

    /// Delete ephemeral agents that have been offline longer than the TTL
    /// or were soft-deleted, together with their session history.
    ///
    /// Returns the number of agents removed.
    #[instrument(skip(self))]
    pub async fn evict_ephemeral_agents(&self) -> CoordinatorResult<usize> {
        let cutoff = self.clock.now() - to_delta(self.settings.ephemeral_agent_ttl);
        let stale = AgentQuery {
            ephemeral: Some(true),
            last_online_before: Some(cutoff),
            ..Default::default()
        };
        let deleted = AgentQuery {
            ephemeral: Some(true),
            deleted: Some(true),
            ..Default::default()
        };

        let mut candidates = BTreeMap::new();
        for query in [stale, deleted] {
            for document in self.durable.agents.find_many(&query).await? {
                candidates.insert(document.id.clone(), document);
            }
        }

        let mut evicted = 0;
        for (id, document) in candidates {
            if let Some(session_id) = document.session_id {
                let live = self
                    .sessions
                    .get_session(&session_id)
                    .await?
                    .is_some_and(|s| !s.is_stopped());
                if live {
                    debug!(agent_id = %id, "Ephemeral agent still online, keeping");
                    continue;
                }
            }
            if !self.durable.agents.delete(&id).await? {
                continue;
            }
            let sessions = self.durable.sessions.delete_by_agent(&id).await?;
            info!(agent_id = %id, sessions, "Evicted ephemeral agent");
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Publish a wake-up for the agent's session, if it has one.
    pub async fn notify(&self, agent: &Agent) -> CoordinatorResult<()> {
        if let Some(session) = &agent.session {
            self.sessions.notify(&session.id).await?;
        }
        Ok(())
    }

    fn live_session<'a>(&self, agent: &'a Agent) -> CoordinatorResult<&'a Session> {
        agent
            .session
            .as_ref()
            .filter(|s| !s.is_stopped())
            .ok_or_else(|| CoordinatorError::NoSession(agent.id().clone()))
    }

    async fn replace_document(
        &self,
        agent: &Agent,
        next: AgentDocument,
    ) -> CoordinatorResult<Option<Agent>> {
        let Some(document) = self.durable.agents.find_and_update(&agent.document, next).await? else {
            return Ok(None);
        };
        let updated = Agent {
            document,
            session: agent.session.clone(),
        };
        self.notify(&updated).await?;
        Ok(Some(updated))
    }

    /// Stop `session` and close out every lease it still held.
    async fn stop_session(&self, session: &Session) -> CoordinatorResult<Option<Session>> {
        let Some(stopped) = self
            .sessions
            .update_session(session, SessionUpdate::stop())
            .await?
        else {
            return Ok(None);
        };
        self.leases.record_finished(&cancel_all(&session.leases)).await;
        Ok(Some(stopped))
    }

    /// Clear the agent's session pointer if it still names `session_id`.
    async fn detach_session(&self, agent_id: &AgentId, session_id: &SessionId) -> CoordinatorResult<()> {
        retry_until_applied("detach session", &self.settings.retry, move || async move {
            let Some(document) = self.durable.agents.find(agent_id).await? else {
                return Ok(Some(()));
            };
            if document.session_id != Some(*session_id) {
                return Ok(Some(()));
            }
            let mut next = document.clone();
            next.session_id = None;
            let applied = self.durable.agents.find_and_update(&document, next).await?;
            Ok::<_, CoordinatorError>(applied.map(|_| ()))
        })
        .await
    }

    async fn finish_session_history(&self, session_id: &SessionId) {
        if let Err(e) = self.durable.sessions.finish(session_id, self.clock.now()).await {
            warn!(session_id = %session_id, error = %e, "Failed to finish session history");
        }
    }
}

/// Outcomes for leases dropped by a stop.
fn cancel_all(leases: &[SessionLease]) -> Vec<(SessionLease, LeaseOutcome)> {
    leases
        .iter()
        .map(|lease| (lease.clone(), LeaseOutcome::Cancelled))
        .collect()
}
