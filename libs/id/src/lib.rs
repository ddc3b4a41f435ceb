//! Identifiers used across the fleet coordinator.
//!
//! [`SessionId`] and [`LeaseId`] are minted by the coordinator as
//! `{prefix}_{ulid}` (`sess_01HV4Z2WQXKJNM8GPQY6VBKC3D`,
//! `lease_01HV4Z3MXNKPQR9HSTZ7WCLD4E`) and never reused. [`AgentId`] is the
//! name an agent enrolls under, e.g. `BUILD-LINUX-042`; parsing folds it to
//! upper case so one machine cannot enroll twice under different casings.
//!
//! Every id serializes as its plain string form.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

#[doc(hidden)]
pub use ulid::Ulid;
