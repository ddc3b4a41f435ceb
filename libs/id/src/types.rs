//! Typed ID definitions for fleet resources.
//!
//! Sessions and leases use generated, prefixed ULIDs. Agents are identified by
//! a stable name assigned at enrollment.

use crate::{define_id, define_name_id};

// =============================================================================
// Agents
// =============================================================================

define_name_id!(AgentId, 64);

// =============================================================================
// Sessions and Leases
// =============================================================================

define_id!(SessionId, "sess");
define_id!(LeaseId, "lease");

// =============================================================================
// Tests
// =============================================================================
