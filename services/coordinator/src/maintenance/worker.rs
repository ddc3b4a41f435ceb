use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::config::CoordinatorSettings;
use crate::state::Coordinator;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub filter_refresh_interval: Duration,
    pub session_sweep_interval: Duration,
    pub filter_eviction_interval: Duration,
    pub agent_eviction_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self::from_settings(&CoordinatorSettings::default())
    }
}

impl MaintenanceConfig {
    pub fn from_settings(settings: &CoordinatorSettings) -> Self {
        Self {
            filter_refresh_interval: settings.filter_refresh_interval,
            session_sweep_interval: settings.sweep_interval,
            filter_eviction_interval: settings.sweep_interval,
            agent_eviction_interval: settings.sweep_interval * 10,
        }
    }
}

/// Runs the periodic filter, session and agent sweeps.
pub struct MaintenanceWorker {
    coordinator: Coordinator,
    config: MaintenanceConfig,
}

impl MaintenanceWorker {
    pub fn new(coordinator: Coordinator, config: MaintenanceConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            filter_refresh_secs = self.config.filter_refresh_interval.as_secs(),
            session_sweep_secs = self.config.session_sweep_interval.as_secs(),
            "Starting maintenance worker"
        );

        // Fill the cache before the first session update needs it.
        self.refresh_filters().await;

        let mut refresh = ticker(self.config.filter_refresh_interval);
        let mut sessions = ticker(self.config.session_sweep_interval);
        let mut filters = ticker(self.config.filter_eviction_interval);
        let mut agents = ticker(self.config.agent_eviction_interval);
        refresh.tick().await;
        sessions.tick().await;
        filters.tick().await;
        agents.tick().await;

        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh_filters().await,
                _ = sessions.tick() => self.terminate_expired_sessions().await,
                _ = filters.tick() => self.evict_idle_filters().await,
                _ = agents.tick() => self.evict_ephemeral_agents().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintenance worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run every sweep once, in dependency order.
    pub async fn run_once(&self) {
        self.refresh_filters().await;
        self.terminate_expired_sessions().await;
        self.evict_idle_filters().await;
        self.evict_ephemeral_agents().await;
    }

    async fn refresh_filters(&self) {
        if let Err(e) = self.coordinator.filters().refresh_cache().await {
            error!(error = %e, "Failed to refresh filter cache");
        }
    }

    async fn terminate_expired_sessions(&self) {
        if let Err(e) = self.coordinator.agents().terminate_expired_sessions().await {
            error!(error = %e, "Failed to terminate expired sessions");
        }
    }

    async fn evict_idle_filters(&self) {
        match self.coordinator.filters().evict_idle_filters().await {
            Ok(count) if count > 0 => info!(evicted = count, "Evicted idle filters"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to evict idle filters"),
        }
    }

    async fn evict_ephemeral_agents(&self) {
        match self.coordinator.agents().evict_ephemeral_agents().await {
            Ok(count) if count > 0 => info!(evicted = count, "Evicted ephemeral agents"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to evict ephemeral agents"),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
