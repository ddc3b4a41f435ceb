//! Capability matching.
//!
//! A filter is a hashed [`Requirements`] set registered in the volatile store.
//! For every filter the store keeps two session-id sets:
//!
//! - **Potential**: sessions whose capabilities meet the requirements
//! - **Available**: the subset of those that can take more work right now
//!
//! Both sets are updated in the same transaction as the session update that
//! changed them, so `Available ⊆ Potential` holds at every point in time.
//! Filters nobody enumerates for the idle window are evicted.

mod matcher;
mod requirements;

pub use matcher::{FilterIndex, FilterMatcher};
pub use requirements::{
    headroom, is_available, meets_requirements, Requirements, ResourceRequirement,
};
