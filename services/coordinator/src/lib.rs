//! Fleet coordinator library.
//!
//! The coordination core of a build-farm fleet: live agent sessions, lease
//! accounting, capability filters and the agent façade, all synchronised
//! through optimistic compare-and-swap against a durable and a volatile
//! store. The `coordinator` binary hosts the maintenance sweeps; the library
//! surface is what request handlers and tests build on.

pub mod agents;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod filters;
pub mod leases;
pub mod maintenance;
pub mod scheduler;
pub mod sessions;
pub mod state;
pub mod volatile;

pub use error::{CoordinatorError, CoordinatorResult};
pub use state::Coordinator;
