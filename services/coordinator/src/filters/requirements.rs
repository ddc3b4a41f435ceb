//! Requirement sets and the matching predicates.

use std::collections::{BTreeMap, BTreeSet};

use fleet_reconcile::{ContentHash, ReconcileError};
use serde::{Deserialize, Serialize};

use crate::sessions::{Capabilities, SessionLease};

/// Bounds on one named resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl ResourceRequirement {
    pub fn at_least(min: u32) -> Self {
        Self { min, max: None }
    }

    pub fn between(min: u32, max: u32) -> Self {
        Self {
            min,
            max: Some(max.max(min)),
        }
    }
}

/// What a unit of work needs from a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRequirement>,
    /// Require the whole session: no other lease may run alongside.
    #[serde(default)]
    pub exclusive: bool,
}

impl Requirements {
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.properties.insert(property.into());
        self
    }

    pub fn resource(mut self, name: impl Into<String>, requirement: ResourceRequirement) -> Self {
        self.resources.insert(name.into(), requirement);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn hash(&self) -> Result<ContentHash, ReconcileError> {
        ContentHash::of(self)
    }

    /// Concrete reservation for a new lease on a session.
    ///
    /// Each required resource gets `min(remaining, max)` (with `max`
    /// defaulting to `min`). Returns `None` if the session cannot take the
    /// lease right now.
    pub fn allocate(
        &self,
        capabilities: &Capabilities,
        leases: &[SessionLease],
    ) -> Option<BTreeMap<String, u32>> {
        if !meets_requirements(capabilities, self) || !is_available(capabilities, leases, self) {
            return None;
        }
        let remaining = headroom(capabilities, leases);
        Some(
            self.resources
                .iter()
                .map(|(name, req)| {
                    let free = remaining.get(name).copied().unwrap_or(0).max(0);
                    let wanted = i64::from(req.max.unwrap_or(req.min).max(req.min));
                    (name.clone(), u32::try_from(free.min(wanted)).unwrap_or(req.min))
                })
                .collect(),
        )
    }
}

/// Every required property is present and every required resource is
/// reported with at least its minimum count.
pub fn meets_requirements(capabilities: &Capabilities, requirements: &Requirements) -> bool {
    requirements.properties.is_subset(&capabilities.properties)
        && requirements
            .resources
            .iter()
            .all(|(name, req)| capabilities.resource(name) >= req.min)
}

/// Whether a matching session can take more work for `requirements` given
/// the leases it already runs.
pub fn is_available(
    capabilities: &Capabilities,
    leases: &[SessionLease],
    requirements: &Requirements,
) -> bool {
    if leases.iter().any(|l| l.exclusive) {
        return false;
    }
    if requirements.exclusive && !leases.is_empty() {
        return false;
    }
    let remaining = headroom(capabilities, leases);
    requirements.resources.iter().all(|(name, req)| {
        let free = remaining
            .get(name)
            .copied()
            .unwrap_or_else(|| i64::from(capabilities.resource(name)));
        free >= i64::from(req.min)
    })
}

/// Reported resources minus every reservation still held by a lease.
pub fn headroom(capabilities: &Capabilities, leases: &[SessionLease]) -> BTreeMap<String, i64> {
    let mut remaining: BTreeMap<String, i64> = capabilities
        .resources
        .iter()
        .map(|(name, count)| (name.clone(), i64::from(*count)))
        .collect();
    for lease in leases.iter().filter(|l| l.state.reserves_resources()) {
        for (name, amount) in &lease.resources {
            *remaining.entry(name.clone()).or_insert(0) -= i64::from(*amount);
        }
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::LeaseState;
    use fleet_id::LeaseId;
    use rstest::rstest;

    fn caps(cpu: u32) -> Capabilities {
        Capabilities::new(["OS=Linux"], [("CPU", cpu)])
    }

    fn lease(cpu: u32, exclusive: bool, state: LeaseState) -> SessionLease {
        SessionLease {
            id: LeaseId::new(),
            parent_id: None,
            state,
            resources: [("CPU".to_string(), cpu)].into_iter().collect(),
            exclusive,
            payload: Vec::new(),
        }
    }

    fn needs_cpu(min: u32) -> Requirements {
        Requirements::default()
            .property("OS=Linux")
            .resource("CPU", ResourceRequirement::at_least(min))
    }

    #[rstest]
    #[case::exact(8, 8, true)]
    #[case::surplus(16, 8, true)]
    #[case::short(4, 8, false)]
    fn test_meets_resource_minimum(#[case] reported: u32, #[case] min: u32, #[case] expected: bool) {
        assert_eq!(meets_requirements(&caps(reported), &needs_cpu(min)), expected);
    }

    #[test]
    fn test_missing_property_does_not_meet() {
        let req = needs_cpu(1).property("GPU");
        assert!(!meets_requirements(&caps(8), &req));
    }

    #[rstest]
    #[case::no_leases(vec![], true)]
    #[case::one_half(vec![(4, false)], true)]
    #[case::full(vec![(4, false), (4, false)], false)]
    #[case::exclusive_lease(vec![(0, true)], false)]
    fn test_availability_after_leases(#[case] held: Vec<(u32, bool)>, #[case] expected: bool) {
        let leases: Vec<_> = held
            .into_iter()
            .map(|(cpu, exclusive)| lease(cpu, exclusive, LeaseState::Active))
            .collect();
        assert_eq!(is_available(&caps(8), &leases, &needs_cpu(4)), expected);
    }

    #[test]
    fn test_exclusive_filter_rejects_any_lease() {
        let req = needs_cpu(1).exclusive(true);
        let leases = vec![lease(1, false, LeaseState::Pending)];
        assert!(!is_available(&caps(8), &leases, &req));
        assert!(is_available(&caps(8), &[], &req));
    }

    #[test]
    fn test_completed_lease_releases_resources() {
        let leases = vec![lease(8, false, LeaseState::Completed)];
        assert!(is_available(&caps(8), &leases, &needs_cpu(4)));
    }

    #[rstest]
    #[case::min_only(ResourceRequirement::at_least(2), 2)]
    #[case::capped_by_max(ResourceRequirement::between(2, 4), 4)]
    #[case::capped_by_headroom(ResourceRequirement::between(2, 16), 6)]
    fn test_allocate_amount(#[case] requirement: ResourceRequirement, #[case] expected: u32) {
        let req = Requirements::default().resource("CPU", requirement);
        let leases = vec![lease(2, false, LeaseState::Active)];
        let allocation = req.allocate(&caps(8), &leases).unwrap();
        assert_eq!(allocation["CPU"], expected);
    }

    #[test]
    fn test_allocate_refuses_when_unavailable() {
        let leases = vec![lease(6, false, LeaseState::Active)];
        assert!(needs_cpu(4).allocate(&caps(8), &leases).is_none());
    }

    #[test]
    fn test_requirements_hash_stable_across_builders() {
        let a = needs_cpu(4).property("Arch=x64");
        let b = Requirements::default()
            .property("Arch=x64")
            .resource("CPU", ResourceRequirement::at_least(4))
            .property("OS=Linux");
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }
}
