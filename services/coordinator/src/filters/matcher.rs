//! Filter registry and per-filter session indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use fleet_id::SessionId;
use fleet_reconcile::{retry_until_applied, ContentHash};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use super::requirements::{is_available, meets_requirements, Requirements};
use crate::clock::{window_ticks, Clock};
use crate::config::CoordinatorSettings;
use crate::error::{decode_record, CoordinatorError, CoordinatorResult};
use crate::sessions::{
    parse_session_id, parse_tick, read_session, Capabilities, SessionLease, SessionState,
};
use crate::volatile::{keys, scan_hash, scan_set, Condition, Op, Transaction, VolatileStore};

/// Which per-filter index to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterIndex {
    /// Sessions that match and can take work now.
    Available,
    /// Sessions that match regardless of load.
    Potential,
}

/// Maintains the filter registry and keeps each filter's session indexes in
/// step with session updates.
pub struct FilterMatcher {
    store: Arc<dyn VolatileStore>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    cache: RwLock<BTreeMap<ContentHash, Arc<Requirements>>>,
}

impl FilterMatcher {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a requirement set and return its hash.
    ///
    /// Registering an existing set only advances its touch time. A newly
    /// registered filter is seeded from the current sessions.
    #[instrument(skip(self, requirements))]
    pub async fn create_filter(&self, requirements: &Requirements) -> CoordinatorResult<ContentHash> {
        let hash = requirements.hash()?;
        let created = retry_until_applied("register filter", &self.settings.retry, || {
            self.register(&hash, requirements)
        })
        .await?;

        self.cache_insert(hash.clone(), requirements.clone());
        if created {
            info!(filter = %hash, "Filter created");
            self.backfill(&hash, requirements).await?;
        }
        Ok(hash)
    }

    /// `Some(true)` if this call registered the filter, `Some(false)` if it
    /// was already registered and has been touched, `None` if it was evicted
    /// between the two steps.
    async fn register(
        &self,
        hash: &ContentHash,
        requirements: &Requirements,
    ) -> CoordinatorResult<Option<bool>> {
        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_not_exists(keys::FILTERS, hash.as_str()))
            .hash_set(
                keys::FILTERS,
                hash.as_str(),
                self.clock.now_ticks().to_string(),
            )
            .set(
                keys::filter_requirements(hash),
                serde_json::to_string(requirements)?,
            );
        if self.store.execute(tx).await? {
            return Ok(Some(true));
        }
        if self.touch_filter(hash).await? {
            return Ok(Some(false));
        }
        debug!(filter = %hash, "Filter evicted while registering");
        Ok(None)
    }

    /// Advance a filter's touch time. Returns `false` if the filter is gone.
    pub async fn touch_filter(&self, hash: &ContentHash) -> CoordinatorResult<bool> {
        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_exists(keys::FILTERS, hash.as_str()))
            .hash_set(
                keys::FILTERS,
                hash.as_str(),
                self.clock.now_ticks().to_string(),
            );
        Ok(self.store.execute(tx).await?)
    }

    /// Hashes of every filter that has not gone idle.
    pub async fn get_filters(&self) -> CoordinatorResult<Vec<ContentHash>> {
        let entries = self.store.hash_get_all(keys::FILTERS).await?;
        let cutoff = self.idle_cutoff();
        let mut live = Vec::with_capacity(entries.len());
        for (hash, touched) in entries {
            if parse_tick(keys::FILTERS, &touched)? < cutoff {
                continue;
            }
            if let Some(hash) = ContentHash::parse(&hash) {
                live.push(hash);
            }
        }
        Ok(live)
    }

    /// Look up the requirements registered under `hash`.
    pub async fn try_get_filter_requirements(
        &self,
        hash: &ContentHash,
    ) -> CoordinatorResult<Option<Requirements>> {
        if let Some(cached) = self.cache_get(hash) {
            return Ok(Some(cached.as_ref().clone()));
        }
        let key = keys::filter_requirements(hash);
        match self.store.get(&key).await? {
            Some(json) => Ok(Some(decode_record(&key, &json)?)),
            None => Ok(None),
        }
    }

    /// Touch the filter and stream the members of one of its indexes.
    ///
    /// Unknown and idle filters yield nothing.
    pub async fn enumerate_filtered_sessions(
        &self,
        hash: &ContentHash,
        index: FilterIndex,
    ) -> CoordinatorResult<BoxStream<'static, CoordinatorResult<SessionId>>> {
        let Some(touched) = self.store.hash_get(keys::FILTERS, hash.as_str()).await? else {
            return Ok(stream::empty().boxed());
        };
        if parse_tick(keys::FILTERS, &touched)? < self.idle_cutoff() {
            return Ok(stream::empty().boxed());
        }
        if !self.touch_filter(hash).await? {
            return Ok(stream::empty().boxed());
        }

        let key = match index {
            FilterIndex::Available => keys::filter_available(hash),
            FilterIndex::Potential => keys::filter_potential(hash),
        };
        Ok(scan_set(self.store.clone(), key, self.settings.scan_page_size)
            .map_err(CoordinatorError::from)
            .and_then(|id| async move { parse_session_id(&id) })
            .boxed())
    }

    /// Rebuild the local cache from the shared registry.
    pub async fn refresh_cache(&self) -> CoordinatorResult<usize> {
        let entries = self.store.hash_get_all(keys::FILTERS).await?;
        let cutoff = self.idle_cutoff();
        let current = self.cache_snapshot();

        let mut refreshed = BTreeMap::new();
        for (hash, touched) in entries {
            if parse_tick(keys::FILTERS, &touched)? < cutoff {
                continue;
            }
            let Some(hash) = ContentHash::parse(&hash) else {
                continue;
            };
            if let Some(requirements) = current.get(&hash) {
                refreshed.insert(hash, requirements.clone());
                continue;
            }
            let key = keys::filter_requirements(&hash);
            if let Some(json) = self.store.get(&key).await? {
                let requirements: Requirements = decode_record(&key, &json)?;
                refreshed.insert(hash, Arc::new(requirements));
            }
        }

        let count = refreshed.len();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = refreshed;
        debug!(filters = count, "Filter cache refreshed");
        Ok(count)
    }

    /// Remove every filter whose touch time is older than the idle window,
    /// along with its indexes and stored requirements.
    #[instrument(skip(self))]
    pub async fn evict_idle_filters(&self) -> CoordinatorResult<usize> {
        let cutoff = self.idle_cutoff();
        let idle: Vec<(String, String)> = scan_hash(
            self.store.clone(),
            keys::FILTERS.to_string(),
            self.settings.scan_page_size,
        )
        .map_err(CoordinatorError::from)
        .try_filter(|(_, touched)| {
            let idle = parse_tick(keys::FILTERS, touched).is_ok_and(|t| t < cutoff);
            async move { idle }
        })
        .try_collect()
        .await?;

        let mut evicted = 0;
        for (hash, touched) in idle {
            let Some(parsed) = ContentHash::parse(&hash) else {
                continue;
            };
            let mut members: BTreeSet<String> = BTreeSet::new();
            for key in [keys::filter_potential(&parsed), keys::filter_available(&parsed)] {
                let found: Vec<String> = scan_set(self.store.clone(), key, self.settings.scan_page_size)
                    .try_collect()
                    .await?;
                members.extend(found);
            }

            let mut tx = Transaction::new();
            tx.condition(Condition::hash_field_equals(keys::FILTERS, &hash, touched))
                .hash_delete(keys::FILTERS, &hash)
                .delete(keys::filter_requirements(&parsed))
                .delete(keys::filter_available(&parsed))
                .delete(keys::filter_potential(&parsed));
            for member in &members {
                if let Ok(session_id) = SessionId::parse(member) {
                    tx.hash_delete(keys::session_filters(&session_id), &hash);
                }
            }
            if self.store.execute(tx).await? {
                info!(filter = %parsed, sessions = members.len(), "Idle filter evicted");
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&parsed);
                evicted += 1;
            } else {
                debug!(filter = %parsed, "Filter touched during eviction, keeping");
            }
        }
        Ok(evicted)
    }

    /// Evaluate every cached filter against a session's capabilities and
    /// leases. Filters the session does not match are absent from the map.
    pub fn find_matching_filters(
        &self,
        capabilities: &Capabilities,
        leases: &[SessionLease],
    ) -> BTreeMap<ContentHash, bool> {
        self.cache_snapshot()
            .iter()
            .filter(|(_, requirements)| meets_requirements(capabilities, requirements))
            .map(|(hash, requirements)| {
                (
                    hash.clone(),
                    is_available(capabilities, leases, requirements),
                )
            })
            .collect()
    }

    /// Append the index mutations that take a session from `previous` to
    /// `next` filter membership.
    ///
    /// Every write to a filter's index is guarded on the filter still being
    /// registered, so a filter evicted mid-update is not resurrected.
    pub fn update_filters(
        &self,
        tx: &mut Transaction,
        session_id: &SessionId,
        previous: &BTreeMap<ContentHash, bool>,
        next: &BTreeMap<ContentHash, bool>,
    ) {
        let member = session_id.to_string();
        let membership_key = keys::session_filters(session_id);
        let hashes: BTreeSet<&ContentHash> = previous.keys().chain(next.keys()).collect();

        for hash in hashes {
            let guard = || Condition::hash_field_exists(keys::FILTERS, hash.as_str());
            let available_key = keys::filter_available(hash);
            let potential_key = keys::filter_potential(hash);

            match (previous.get(hash).copied(), next.get(hash).copied()) {
                (None, Some(available)) => {
                    tx.guarded(
                        guard(),
                        Op::SetAdd {
                            key: potential_key,
                            member: member.clone(),
                        },
                    );
                    if available {
                        tx.guarded(
                            guard(),
                            Op::SetAdd {
                                key: available_key,
                                member: member.clone(),
                            },
                        );
                    }
                    tx.guarded(guard(), membership_op(&membership_key, hash, available));
                }
                (Some(was), Some(available)) if was != available => {
                    let op = if available {
                        Op::SetAdd {
                            key: available_key,
                            member: member.clone(),
                        }
                    } else {
                        Op::SetRemove {
                            key: available_key,
                            member: member.clone(),
                        }
                    };
                    tx.guarded(guard(), op);
                    tx.guarded(guard(), membership_op(&membership_key, hash, available));
                }
                (Some(_), None) => {
                    tx.guarded(
                        guard(),
                        Op::SetRemove {
                            key: available_key,
                            member: member.clone(),
                        },
                    );
                    tx.guarded(
                        guard(),
                        Op::SetRemove {
                            key: potential_key,
                            member: member.clone(),
                        },
                    );
                    tx.hash_delete(membership_key.as_str(), hash.as_str());
                }
                _ => {}
            }
        }
    }

    /// Append the mutations that drop a session from every filter it is in.
    pub fn remove_from_filters(
        &self,
        tx: &mut Transaction,
        session_id: &SessionId,
        previous: &BTreeMap<ContentHash, bool>,
    ) {
        self.update_filters(tx, session_id, previous, &BTreeMap::new());
        tx.delete(keys::session_filters(session_id));
    }

    /// Seed a new filter's indexes from every live session.
    async fn backfill(&self, hash: &ContentHash, requirements: &Requirements) -> CoordinatorResult<()> {
        let ids: Vec<(String, String)> = scan_hash(
            self.store.clone(),
            keys::SESSIONS.to_string(),
            self.settings.scan_page_size,
        )
        .try_collect()
        .await?;

        let mut seeded = 0usize;
        for (id, _) in ids {
            let session_id = parse_session_id(&id)?;
            let applied = retry_until_applied("filter backfill", &self.settings.retry, || {
                self.backfill_session(hash, requirements, &session_id)
            })
            .await?;
            if applied {
                seeded += 1;
            }
        }
        debug!(filter = %hash, sessions = seeded, "Filter backfilled");
        Ok(())
    }

    /// Write one session's membership of a new filter.
    ///
    /// Returns `Some(true)` if the session was written, `Some(false)` if it
    /// needed no change, `None` if its tick moved underneath us.
    async fn backfill_session(
        &self,
        hash: &ContentHash,
        requirements: &Requirements,
        session_id: &SessionId,
    ) -> CoordinatorResult<Option<bool>> {
        let Some(session) =
            read_session(self.store.as_ref(), session_id, self.settings.session_expiry).await?
        else {
            return Ok(Some(false));
        };
        if session.is_stopped() {
            return Ok(Some(false));
        }

        let wanted = meets_requirements(&session.capabilities, requirements)
            .then(|| is_available(&session.capabilities, &session.leases, requirements));
        if wanted.is_none() && !session.filters.contains_key(hash) {
            return Ok(Some(false));
        }

        // The filter is new, so any recorded membership predates it. Write
        // the wanted state outright instead of diffing against it.
        let ticks = session.update_ticks + 1;
        let mut tx = Transaction::new();
        tx.condition(Condition::hash_field_equals(
            keys::SESSIONS,
            session_id.to_string(),
            session.update_ticks.to_string(),
        ));
        self.assign_membership(&mut tx, session_id, hash, wanted);
        tx.set(
            keys::session_state(session_id),
            serde_json::to_string(&SessionState::of(&session, ticks))?,
        )
        .hash_set(keys::SESSIONS, session_id.to_string(), ticks.to_string());
        Ok(self.store.execute(tx).await?.then_some(true))
    }

    /// Append the guarded writes that set a session's membership of one
    /// filter to `wanted`, whatever it was before.
    fn assign_membership(
        &self,
        tx: &mut Transaction,
        session_id: &SessionId,
        hash: &ContentHash,
        wanted: Option<bool>,
    ) {
        let member = session_id.to_string();
        let membership_key = keys::session_filters(session_id);
        let guard = || Condition::hash_field_exists(keys::FILTERS, hash.as_str());
        let set_op = |add: bool, key: String| {
            let member = member.clone();
            if add {
                Op::SetAdd { key, member }
            } else {
                Op::SetRemove { key, member }
            }
        };

        match wanted {
            Some(available) => {
                tx.guarded(guard(), set_op(true, keys::filter_potential(hash)))
                    .guarded(guard(), set_op(available, keys::filter_available(hash)))
                    .guarded(guard(), membership_op(&membership_key, hash, available));
            }
            None => {
                tx.guarded(guard(), set_op(false, keys::filter_available(hash)))
                    .guarded(guard(), set_op(false, keys::filter_potential(hash)))
                    .hash_delete(membership_key, hash.as_str());
            }
        }
    }

    fn idle_cutoff(&self) -> i64 {
        self.clock.now_ticks() - window_ticks(self.settings.filter_idle_window)
    }

    fn cache_insert(&self, hash: ContentHash, requirements: Requirements) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash)
            .or_insert_with(|| Arc::new(requirements));
    }

    fn cache_get(&self, hash: &ContentHash) -> Option<Arc<Requirements>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    fn cache_snapshot(&self) -> BTreeMap<ContentHash, Arc<Requirements>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn membership_op(key: &str, hash: &ContentHash, available: bool) -> Op {
    Op::HashSet {
        key: key.to_string(),
        field: hash.to_string(),
        value: if available { "1" } else { "0" }.to_string(),
    }
}
