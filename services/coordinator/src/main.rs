//! Fleet coordinator
//!
//! Hosts the maintenance sweeps over the session and agent stores: filter
//! cache refresh, session expiry, idle filter eviction and ephemeral agent
//! eviction.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_coordinator::{
    clock::SystemClock,
    config::Config,
    db::{Database, DurableStore},
    maintenance::{MaintenanceConfig, MaintenanceWorker},
    volatile::MemoryVolatileStore,
    Coordinator,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        dev_mode = config.dev_mode,
        session_expiry_secs = config.settings.session_expiry.as_secs(),
        "Starting fleet coordinator"
    );

    let durable = if config.dev_mode {
        info!("Using in-memory durable store (dev mode)");
        DurableStore::memory()
    } else {
        let db = match Database::connect(&config.database).await {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "Failed to connect to database");
                return Err(e.into());
            }
        };
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
        DurableStore::postgres(&db)
    };

    let coordinator = Coordinator::new(
        Arc::new(MemoryVolatileStore::new()),
        durable,
        Arc::new(SystemClock),
        config.settings.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = MaintenanceWorker::new(
        coordinator.clone(),
        MaintenanceConfig::from_settings(&config.settings),
    );
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Maintenance worker panicked"),
        Err(e) => warn!(error = %e, "Maintenance worker did not shut down in time"),
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
