//! Service wiring shared by the binary and the integration tests.

use std::sync::Arc;

use crate::agents::AgentService;
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorSettings;
use crate::db::DurableStore;
use crate::filters::FilterMatcher;
use crate::leases::LeaseManager;
use crate::sessions::SessionManager;
use crate::volatile::{MemoryVolatileStore, VolatileStore};

/// Handles to every coordinator service, built over one pair of stores.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    volatile: Arc<dyn VolatileStore>,
    durable: DurableStore,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    filters: Arc<FilterMatcher>,
    sessions: Arc<SessionManager>,
    leases: Arc<LeaseManager>,
    agents: Arc<AgentService>,
}

impl Coordinator {
    pub fn new(
        volatile: Arc<dyn VolatileStore>,
        durable: DurableStore,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let filters = Arc::new(FilterMatcher::new(
            volatile.clone(),
            clock.clone(),
            settings.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            volatile.clone(),
            clock.clone(),
            filters.clone(),
            settings.clone(),
        ));
        let leases = Arc::new(LeaseManager::new(
            volatile.clone(),
            sessions.clone(),
            durable.leases.clone(),
            clock.clone(),
            settings.clone(),
        ));
        let agents = Arc::new(AgentService::new(
            sessions.clone(),
            leases.clone(),
            durable.clone(),
            clock.clone(),
            settings.clone(),
        ));

        Self {
            inner: Arc::new(CoordinatorInner {
                volatile,
                durable,
                clock,
                settings,
                filters,
                sessions,
                leases,
                agents,
            }),
        }
    }

    /// Fully in-memory coordinator on the system clock.
    pub fn memory(settings: CoordinatorSettings) -> Self {
        Self::new(
            Arc::new(MemoryVolatileStore::new()),
            DurableStore::memory(),
            Arc::new(SystemClock),
            settings,
        )
    }

    pub fn volatile(&self) -> &Arc<dyn VolatileStore> {
        &self.inner.volatile
    }

    pub fn durable(&self) -> &DurableStore {
        &self.inner.durable
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn filters(&self) -> &Arc<FilterMatcher> {
        &self.inner.filters
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.inner.leases
    }

    pub fn agents(&self) -> &Arc<AgentService> {
        &self.inner.agents
    }
}
