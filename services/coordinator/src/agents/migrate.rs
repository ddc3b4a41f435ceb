//! Step-wise agent document upgrades.
//!
//! Each call to [`upgrade_step`] moves a document exactly one schema version
//! forward. The caller writes every step with a conditioned update, so two
//! readers upgrading the same stale document cannot both win.

use std::collections::BTreeSet;

use crate::db::{AgentDocument, CURRENT_SCHEMA_VERSION};

/// Whether `doc` is behind the current schema.
pub fn needs_upgrade(doc: &AgentDocument) -> bool {
    doc.schema_version < CURRENT_SCHEMA_VERSION
}

/// Apply the single transformation from `doc.schema_version` to the next
/// version. Documents already current are returned unchanged.
pub fn upgrade_step(mut doc: AgentDocument) -> AgentDocument {
    match doc.schema_version {
        // v0 kept one pool list; split it into operator-assigned pools.
        0 => {
            let legacy = std::mem::take(&mut doc.legacy_pools);
            doc.explicit_pools.extend(legacy);
            doc.schema_version = 1;
        }
        // v1 allowed duplicates and stray whitespace.
        1 => {
            doc.explicit_pools = normalize_pools(doc.explicit_pools.drain(..));
            doc.dynamic_pools = normalize_pools(doc.dynamic_pools.drain(..));
            doc.workspaces.sort();
            doc.workspaces.dedup();
            doc.schema_version = 2;
        }
        _ => {}
    }
    doc
}

/// Trim, drop empties, sort and de-duplicate pool names.
pub fn normalize_pools(pools: impl IntoIterator<Item = String>) -> Vec<String> {
    pools
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_id::AgentId;

    fn v0(pools: &[&str]) -> AgentDocument {
        let mut doc = AgentDocument::new(AgentId::parse("legacy").unwrap(), false, Utc::now());
        doc.schema_version = 0;
        doc.legacy_pools = pools.iter().map(|p| p.to_string()).collect();
        doc
    }

    #[test]
    fn test_one_version_per_step() {
        let doc = v0(&["b ", "a", "a"]);
        let step1 = upgrade_step(doc);
        assert_eq!(step1.schema_version, 1);
        assert!(step1.legacy_pools.is_empty());
        assert_eq!(step1.explicit_pools, vec!["b ", "a", "a"]);

        let step2 = upgrade_step(step1);
        assert_eq!(step2.schema_version, 2);
        assert_eq!(step2.explicit_pools, vec!["a", "b"]);
        assert!(!needs_upgrade(&step2));
    }

    #[test]
    fn test_current_document_unchanged() {
        let doc = AgentDocument::new(AgentId::parse("new").unwrap(), false, Utc::now());
        assert_eq!(upgrade_step(doc.clone()), doc);
    }
}
