//! Membership diff for relationship-set fields
//!
//! Several resources carry a field that is nothing but a set of foreign
//! identifiers: spaces sharing a service instance, orgs assigned to a
//! quota, spaces bound to a security group. Reconciling those is a set
//! difference, never a wholesale replace - replacing everything disturbs
//! other actors sharing the entity and trips per-space binding quotas.

use std::collections::BTreeSet;

/// The two halves of a relationship reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff {
    /// In the plan, missing from state
    pub added: BTreeSet<String>,
    /// In state, missing from the plan
    pub removed: BTreeSet<String>,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Split plan vs state membership into added and removed subsets.
pub fn diff_sets(plan: &BTreeSet<String>, state: &BTreeSet<String>) -> SetDiff {
    SetDiff {
        added: plan.difference(state).cloned().collect(),
        removed: state.difference(plan).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_splits_membership() {
        let diff = diff_sets(&set(&["b", "c"]), &set(&["a", "b"]));
        assert_eq!(diff.added, set(&["c"]));
        assert_eq!(diff.removed, set(&["a"]));
    }

    #[test]
    fn test_identical_sets_are_a_noop() {
        let members = set(&["a", "b"]);
        let diff = diff_sets(&members, &members);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_added_and_removed_are_disjoint_and_exhaustive() {
        let cases = [
            (set(&[]), set(&[])),
            (set(&["a"]), set(&[])),
            (set(&[]), set(&["a"])),
            (set(&["a", "b", "c"]), set(&["b", "d"])),
        ];
        for (plan, state) in cases {
            let diff = diff_sets(&plan, &state);
            assert!(diff.added.is_disjoint(&diff.removed));

            let mut rebuilt: BTreeSet<String> =
                state.difference(&diff.removed).cloned().collect();
            rebuilt.extend(diff.added.clone());
            assert_eq!(rebuilt, plan);
        }
    }
}
