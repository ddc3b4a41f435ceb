//! Agent façade.
//!
//! Joins the durable agent document with the volatile session it points at
//! and exposes retry-on-conflict mutators over the pair.

mod migrate;
mod model;
mod service;

pub use migrate::{needs_upgrade, normalize_pools, upgrade_step};
pub use model::{Agent, AgentSettings, SessionReport};
pub use service::AgentService;
