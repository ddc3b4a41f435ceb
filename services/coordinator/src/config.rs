use std::time::Duration;

use anyhow::Result;
use fleet_reconcile::RetryPolicy;

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub settings: CoordinatorSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        let defaults = CoordinatorSettings::default();
        let settings = CoordinatorSettings {
            session_expiry: secs_from_env("FLEET_SESSION_EXPIRY_SECS", defaults.session_expiry)?,
            filter_idle_window: secs_from_env("FLEET_FILTER_IDLE_SECS", defaults.filter_idle_window)?,
            ephemeral_agent_ttl: secs_from_env(
                "FLEET_EPHEMERAL_AGENT_TTL_SECS",
                defaults.ephemeral_agent_ttl,
            )?,
            filter_refresh_interval: secs_from_env(
                "FLEET_FILTER_REFRESH_SECS",
                defaults.filter_refresh_interval,
            )?,
            sweep_interval: secs_from_env("FLEET_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            ..defaults
        };

        Ok(Self {
            log_level,
            dev_mode,
            database,
            settings,
        })
    }
}

fn secs_from_env(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => Ok(Duration::from_secs(value.parse()?)),
        Err(_) => Ok(default),
    }
}

/// Timing knobs shared by the coordinator services.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// A session not updated within this window is expired.
    pub session_expiry: Duration,

    /// A filter not touched within this window is evicted.
    pub filter_idle_window: Duration,

    /// Ephemeral agents offline for longer than this are deleted.
    pub ephemeral_agent_ttl: Duration,

    /// How often the local filter cache is rebuilt.
    pub filter_refresh_interval: Duration,

    /// How often the expiry and eviction sweeps run.
    pub sweep_interval: Duration,

    /// Minimum gap between `last_online_time` writes from heartbeats.
    pub online_refresh_interval: Duration,

    /// Page size for cursor scans over the volatile store.
    pub scan_page_size: usize,

    /// Budget for internal retry loops.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            session_expiry: Duration::from_secs(300),
            filter_idle_window: Duration::from_secs(30 * 60),
            ephemeral_agent_ttl: Duration::from_secs(60 * 60),
            filter_refresh_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            online_refresh_interval: Duration::from_secs(60),
            scan_page_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}
