//! Periodic background sweeps.

mod worker;

pub use worker::{MaintenanceConfig, MaintenanceWorker};
