//! Session state machine over the volatile store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_id::{AgentId, LeaseId, SessionId};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument};

use super::model::{Capabilities, Session, SessionLease, SessionState, SessionStatus, SessionUpdate};
use crate::clock::{from_ticks, to_delta, window_ticks, Clock};
use crate::config::CoordinatorSettings;
use crate::error::{decode_record, CoordinatorError, CoordinatorResult};
use crate::filters::FilterMatcher;
use crate::volatile::{keys, scan_hash, Condition, SubscriptionEvent, Transaction, VolatileStore};

/// Owns session creation, CAS updates, expiry and change notification.
pub struct SessionManager {
    store: Arc<dyn VolatileStore>,
    clock: Arc<dyn Clock>,
    filters: Arc<FilterMatcher>,
    settings: CoordinatorSettings,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        clock: Arc<dyn Clock>,
        filters: Arc<FilterMatcher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            clock,
            filters,
            settings,
        }
    }

    pub fn filters(&self) -> &Arc<FilterMatcher> {
        &self.filters
    }

    /// Create a session under a caller-chosen id.
    ///
    /// Returns `None` if a session is already recorded for `session_id`.
    #[instrument(skip_all, fields(agent_id = %agent_id, session_id = %session_id))]
    pub async fn create_session(
        &self,
        agent_id: &AgentId,
        session_id: SessionId,
        capabilities: Capabilities,
    ) -> CoordinatorResult<Option<Session>> {
        let ticks = self.clock.now_ticks();
        let capabilities_hash = capabilities.hash()?;
        let state = SessionState {
            agent_id: agent_id.clone(),
            status: SessionStatus::Ok,
            capabilities_hash: capabilities_hash.clone(),
            leases: Vec::new(),
            update_ticks: ticks,
        };
        let filters = self.filters.find_matching_filters(&capabilities, &[]);

        let id = session_id.to_string();
        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_not_exists(keys::SESSIONS, id.as_str()))
            .hash_set(keys::SESSIONS, id.as_str(), ticks.to_string())
            .set(keys::session_state(&session_id), serde_json::to_string(&state)?)
            .set(
                keys::session_capabilities(&session_id),
                serde_json::to_string(&capabilities)?,
            );
        self.filters
            .update_filters(&mut tx, &session_id, &BTreeMap::new(), &filters);
        tx.publish(keys::SESSION_UPDATES, id.as_str());

        if !self.store.execute(tx).await? {
            debug!("Session id already recorded");
            return Ok(None);
        }

        info!("Session created");
        // Filters evicted between matching and commit were skipped by their guards.
        self.get_session(&session_id).await
    }

    pub async fn get_session(&self, session_id: &SessionId) -> CoordinatorResult<Option<Session>> {
        read_session(self.store.as_ref(), session_id, self.settings.session_expiry).await
    }

    /// Apply `update` on top of `previous`, conditioned on `previous`'s tick
    /// still being current.
    ///
    /// Returns `None` if another writer updated the session first. Stopping a
    /// session clears its leases, drops it from every filter and pushes its
    /// tick one expiry window into the future.
    #[instrument(skip_all, fields(session_id = %previous.id))]
    pub async fn update_session(
        &self,
        previous: &Session,
        update: SessionUpdate,
    ) -> CoordinatorResult<Option<Session>> {
        let now = self.clock.now_ticks();
        let status = update.status.unwrap_or(previous.status);
        let stopping = status == SessionStatus::Stopped;

        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_equals(
            keys::SESSIONS,
            previous.id.to_string(),
            previous.update_ticks.to_string(),
        ));

        let (ticks, capabilities, leases, filters) = if stopping {
            let ticks = (previous.update_ticks + 1)
                .max(now.saturating_add(window_ticks(self.settings.session_expiry)));
            self.filters
                .remove_from_filters(&mut tx, &previous.id, &previous.filters);
            (ticks, previous.capabilities.clone(), Vec::new(), BTreeMap::new())
        } else {
            let ticks = (previous.update_ticks + 1).max(now);
            let capabilities = update
                .capabilities
                .unwrap_or_else(|| previous.capabilities.clone());
            let leases = update.leases.unwrap_or_else(|| previous.leases.clone());
            let filters = self.filters.find_matching_filters(&capabilities, &leases);
            self.filters
                .update_filters(&mut tx, &previous.id, &previous.filters, &filters);
            (ticks, capabilities, leases, filters)
        };

        let capabilities_hash = capabilities.hash()?;
        if capabilities_hash != previous.capabilities_hash {
            tx.set(
                keys::session_capabilities(&previous.id),
                serde_json::to_string(&capabilities)?,
            );
        }

        reconcile_lease_indexes(&mut tx, &previous.leases, &leases);

        let state = SessionState {
            agent_id: previous.agent_id.clone(),
            status,
            capabilities_hash: capabilities_hash.clone(),
            leases,
            update_ticks: ticks,
        };
        tx.set(keys::session_state(&previous.id), serde_json::to_string(&state)?)
            .hash_set(keys::SESSIONS, previous.id.to_string(), ticks.to_string());

        let visible_change = status != previous.status
            || capabilities_hash != previous.capabilities_hash
            || state.leases != previous.leases;
        if visible_change {
            tx.publish(keys::SESSION_UPDATES, previous.id.to_string());
        }

        if !self.store.execute(tx).await? {
            debug!("Session update lost a race");
            return Ok(None);
        }

        if status != previous.status {
            info!(from = ?previous.status, to = ?status, "Session status changed");
        }

        Ok(Some(Session {
            id: previous.id,
            agent_id: state.agent_id,
            status,
            capabilities,
            capabilities_hash,
            leases: state.leases,
            update_ticks: ticks,
            expires_at: from_ticks(ticks) + to_delta(self.settings.session_expiry),
            filters,
        }))
    }

    /// Remove every trace of a session, conditioned on its tick.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub async fn delete_session(&self, session: &Session) -> CoordinatorResult<bool> {
        let id = session.id.to_string();
        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_equals(
            keys::SESSIONS,
            id.as_str(),
            session.update_ticks.to_string(),
        ));
        self.filters
            .remove_from_filters(&mut tx, &session.id, &session.filters);
        reconcile_lease_indexes(&mut tx, &session.leases, &[]);
        tx.hash_delete(keys::SESSIONS, id.as_str())
            .delete(keys::session_state(&session.id))
            .delete(keys::session_capabilities(&session.id))
            .publish(keys::SESSION_UPDATES, id.as_str());

        let deleted = self.store.execute(tx).await?;
        if deleted {
            info!("Session deleted");
        }
        Ok(deleted)
    }

    /// Stream sessions whose tick is older than the expiry window.
    ///
    /// Each call starts a fresh scan against the time of the call.
    pub fn find_expired_sessions(&self) -> BoxStream<'static, CoordinatorResult<Session>> {
        let store = self.store.clone();
        let expiry = self.settings.session_expiry;
        let cutoff = self.clock.now_ticks() - window_ticks(expiry);

        scan_hash(
            self.store.clone(),
            keys::SESSIONS.to_string(),
            self.settings.scan_page_size,
        )
        .map_err(CoordinatorError::from)
        .try_filter_map(move |(id, ticks)| {
            let store = store.clone();
            async move {
                if parse_tick(keys::SESSIONS, &ticks)? >= cutoff {
                    return Ok(None);
                }
                let session_id = parse_session_id(&id)?;
                let session = read_session(store.as_ref(), &session_id, expiry).await?;
                Ok::<_, CoordinatorError>(session.filter(|s| s.update_ticks < cutoff))
            }
        })
        .boxed()
    }

    /// Publish a change notification for a session without modifying it.
    pub async fn notify(&self, session_id: &SessionId) -> CoordinatorResult<()> {
        let mut tx = Transaction::new();
        tx.publish(keys::SESSION_UPDATES, session_id.to_string());
        self.store.execute(tx).await?;
        Ok(())
    }

    /// Wait until `session` changes, a notification for it is published, or
    /// `timeout` elapses, then return the current state. Returns `None` if
    /// the session no longer exists.
    pub async fn wait_for_session_update(
        &self,
        session: &Session,
        timeout: Duration,
    ) -> CoordinatorResult<Option<Session>> {
        let deadline = Instant::now() + timeout;
        let mut subscription = self.store.subscribe(keys::SESSION_UPDATES).await?;
        let wanted = session.id.to_string();

        // Re-read after subscribing so an update that landed in between is not missed.
        let Some(current) = self.get_session(&session.id).await? else {
            return Ok(None);
        };
        if current.update_ticks != session.update_ticks {
            return Ok(Some(current));
        }

        let woke = timeout_at(deadline, async {
            loop {
                match subscription.recv().await {
                    SubscriptionEvent::Message(id) if id == wanted => break,
                    SubscriptionEvent::Message(_) => continue,
                    SubscriptionEvent::Lagged(skipped) => {
                        debug!(skipped, "Session update subscription lagged");
                        break;
                    }
                    SubscriptionEvent::Closed => break,
                }
            }
        })
        .await;

        if woke.is_err() {
            debug!(session_id = %session.id, "Wait for session update timed out");
        }
        self.get_session(&session.id).await
    }
}

/// Keep the active-lease set and parent child-sets in step with a lease
/// list change.
fn reconcile_lease_indexes(tx: &mut Transaction, previous: &[SessionLease], next: &[SessionLease]) {
    let live = |leases: &[SessionLease]| -> BTreeMap<LeaseId, Option<LeaseId>> {
        leases
            .iter()
            .filter(|l| !l.state.is_terminal())
            .map(|l| (l.id, l.parent_id))
            .collect()
    };
    let before = live(previous);
    let after = live(next);

    for (id, parent) in &after {
        if !before.contains_key(id) {
            tx.set_add(keys::ACTIVE_LEASES, id.to_string());
            if let Some(parent) = parent {
                tx.set_add(keys::lease_children(parent), id.to_string());
            }
        }
    }
    for (id, parent) in &before {
        if !after.contains_key(id) {
            tx.set_remove(keys::ACTIVE_LEASES, id.to_string());
            if let Some(parent) = parent {
                tx.set_remove(keys::lease_children(parent), id.to_string());
            }
        }
    }
}

/// Load a session's state, capabilities and filter membership.
pub(crate) async fn read_session(
    store: &dyn VolatileStore,
    session_id: &SessionId,
    expiry: Duration,
) -> CoordinatorResult<Option<Session>> {
    let state_key = keys::session_state(session_id);
    let Some(json) = store.get(&state_key).await? else {
        return Ok(None);
    };
    let state: SessionState = decode_record(&state_key, &json)?;

    let capabilities_key = keys::session_capabilities(session_id);
    let capabilities: Capabilities = match store.get(&capabilities_key).await? {
        Some(json) => decode_record(&capabilities_key, &json)?,
        None => Capabilities::default(),
    };

    let filters = store
        .hash_get_all(&keys::session_filters(session_id))
        .await?
        .into_iter()
        .filter_map(|(hash, available)| {
            fleet_reconcile::ContentHash::parse(&hash).map(|h| (h, available == "1"))
        })
        .collect();

    Ok(Some(Session {
        id: *session_id,
        agent_id: state.agent_id,
        status: state.status,
        capabilities,
        capabilities_hash: state.capabilities_hash,
        leases: state.leases,
        update_ticks: state.update_ticks,
        expires_at: from_ticks(state.update_ticks) + to_delta(expiry),
        filters,
    }))
}

pub(crate) fn parse_tick(key: &str, value: &str) -> CoordinatorResult<i64> {
    value
        .parse()
        .map_err(|e| CoordinatorError::corrupt(key, format!("bad tick {value:?}: {e}")))
}

pub(crate) fn parse_session_id(value: &str) -> CoordinatorResult<SessionId> {
    SessionId::parse(value).map_err(|e| CoordinatorError::corrupt(keys::SESSIONS, e))
}
