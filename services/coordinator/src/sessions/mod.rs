//! Live agent sessions.
//!
//! A session is one connected run of an agent. Its state lives in the
//! volatile store and is versioned by an update-tick (epoch milliseconds)
//! that strictly increases on every successful update. All writers race on
//! that tick; a lost race surfaces as `Ok(None)`.

mod manager;
mod model;

pub use manager::SessionManager;
pub(crate) use manager::{parse_session_id, parse_tick, read_session};
pub(crate) use model::SessionState;
pub use model::{
    Capabilities, LeaseState, Session, SessionLease, SessionStatus, SessionUpdate,
};
