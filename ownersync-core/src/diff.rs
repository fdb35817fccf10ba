//! Diff engine.
//!
//! Both snapshots are reduced to their `(role, member)` pair sets (managers
//! included as `(manager, member)`). Removals are `target − source`,
//! additions are `source − target`. The result is ordered removals first,
//! then role updates, then additions; each group sorted by member then role.
//! The order is what operation keys are derived from, so it must be stable
//! for identical inputs.

use std::collections::BTreeMap;

use crate::types::{ChangeOperation, MemberId, Role, RoleAssignment, StateSnapshot};

/// Knobs for [`compute_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DiffOptions {
    /// Fold a single non-manager role swap for one member into `update_role`
    /// instead of `remove` + `add`.
    #[serde(default)]
    pub collapse_role_changes: bool,
}

/// Operations transforming `target` into `source`. Empty means converged.
pub fn compute(source: &StateSnapshot, target: &StateSnapshot) -> Vec<ChangeOperation> {
    compute_with(source, target, DiffOptions::default())
}

pub fn compute_with(
    source: &StateSnapshot,
    target: &StateSnapshot,
    options: DiffOptions,
) -> Vec<ChangeOperation> {
    let source_pairs = source.pairs();
    let target_pairs = target.pairs();

    let mut removals: Vec<&RoleAssignment> = target_pairs.difference(&source_pairs).collect();
    let mut additions: Vec<&RoleAssignment> = source_pairs.difference(&target_pairs).collect();
    removals.sort_by(|a, b| (&a.member, &a.role).cmp(&(&b.member, &b.role)));
    additions.sort_by(|a, b| (&a.member, &a.role).cmp(&(&b.member, &b.role)));

    let mut updates = Vec::new();
    if options.collapse_role_changes {
        updates = collapse(&mut removals, &mut additions);
    }

    // A manager removal is destructive when the source names no manager, or
    // when it takes the target's last remaining manager at its point in the
    // batch (additions only run after every removal).
    let ownerless = source.managers.is_empty();
    let mut remaining_managers = target.managers.len();

    let mut ops = Vec::with_capacity(removals.len() + updates.len() + additions.len());
    for r in removals {
        let mut op = ChangeOperation::remove(r.member.clone(), r.role.clone());
        if r.role.is_manager() {
            remaining_managers = remaining_managers.saturating_sub(1);
            op.destructive = ownerless || remaining_managers == 0;
        }
        ops.push(op);
    }
    ops.extend(updates);
    for a in additions {
        ops.push(ChangeOperation::add(a.member.clone(), a.role.clone()));
    }
    ops
}

/// Pull out members who lose exactly one non-manager role and gain exactly
/// one; those become `update_role` operations (sorted by member).
fn collapse(
    removals: &mut Vec<&RoleAssignment>,
    additions: &mut Vec<&RoleAssignment>,
) -> Vec<ChangeOperation> {
    let plain = |pairs: &[&RoleAssignment]| {
        let mut by_member: BTreeMap<MemberId, Vec<Role>> = BTreeMap::new();
        for p in pairs.iter().filter(|p| !p.role.is_manager()) {
            by_member.entry(p.member.clone()).or_default().push(p.role.clone());
        }
        by_member
    };
    let removed = plain(removals.as_slice());
    let added = plain(additions.as_slice());

    let mut updates = Vec::new();
    for (member, from) in &removed {
        if let (Some(to), [from]) = (added.get(member), from.as_slice()) {
            if let [to] = to.as_slice() {
                updates.push(ChangeOperation::update(member.clone(), from.clone(), to.clone()));
            }
        }
    }

    removals.retain(|r| {
        !updates
            .iter()
            .any(|u| u.member == r.member && u.before.as_ref() == Some(&r.role))
    });
    additions.retain(|a| {
        !updates
            .iter()
            .any(|u| u.member == a.member && u.after.as_ref() == Some(&a.role))
    });
    updates
}

/// Apply `ops` to a copy of `target` in memory.
pub fn converge(target: &StateSnapshot, ops: &[ChangeOperation]) -> StateSnapshot {
    let mut state = target.clone();
    for op in ops {
        if let Some(role) = &op.before {
            if role.is_manager() {
                state.managers.retain(|m| m != &op.member);
            } else {
                state.assignments.remove(&RoleAssignment {
                    role: role.clone(),
                    member: op.member.clone(),
                });
            }
        }
        if let Some(role) = &op.after {
            if role.is_manager() {
                if !state.managers.contains(&op.member) {
                    state.managers.push(op.member.clone());
                }
            } else {
                state.assignments.insert(RoleAssignment {
                    role: role.clone(),
                    member: op.member.clone(),
                });
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    fn source() -> StateSnapshot {
        StateSnapshot::new("directory", "payments")
            .with_manager("alice")
            .with_assignment("member", "bob")
            .with_assignment("maintainer", "carol")
            .with_assignment("member", "erin")
    }

    fn target() -> StateSnapshot {
        StateSnapshot::new("github", "org/payments")
            .with_manager("dave")
            .with_assignment("member", "carol")
            .with_assignment("member", "bob")
            .with_assignment("member", "frank")
    }

    #[test]
    fn test_identical_snapshots_converge() {
        assert!(compute(&source(), &source()).is_empty());
        assert!(compute(&target(), &target()).is_empty());
    }

    #[test]
    fn test_removals_precede_additions_sorted_by_member() {
        let ops = compute(&source(), &target());
        let rendered: Vec<String> = ops.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "remove(carol, member)",
                "remove(dave, manager)",
                "remove(frank, member)",
                "add(alice, manager)",
                "add(carol, maintainer)",
                "add(erin, member)",
            ]
        );
        // dave is the target's only manager; alice is only added later.
        let destructive: Vec<String> = ops
            .iter()
            .filter(|o| o.destructive)
            .map(|o| o.to_string())
            .collect();
        assert_eq!(destructive, vec!["remove(dave, manager)"]);
    }

    #[test]
    fn test_applying_diff_yields_source() {
        let (s, t) = (source(), target());
        let after = converge(&t, &compute(&s, &t));
        assert_eq!(after.pairs(), s.pairs());

        // And the other direction.
        let back = converge(&s, &compute(&t, &s));
        assert_eq!(back.pairs(), t.pairs());
    }

    #[test]
    fn test_output_is_deterministic() {
        let (s, t) = (source(), target());
        let first = serde_json::to_vec(&compute(&s, &t)).unwrap();
        for _ in 0..10 {
            assert_eq!(serde_json::to_vec(&compute(&s, &t)).unwrap(), first);
        }
    }

    #[test]
    fn test_manager_order_is_not_drift() {
        let s = StateSnapshot::new("a", "u").with_manager("x").with_manager("y");
        let t = StateSnapshot::new("b", "u").with_manager("y").with_manager("x");
        assert!(compute(&s, &t).is_empty());
    }

    #[test]
    fn test_removing_sole_manager_is_destructive() {
        let s = StateSnapshot::new("directory", "payments");
        let t = StateSnapshot::new("github", "org/payments").with_manager("alice");
        let ops = compute(&s, &t);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::RemoveMember);
        assert!(ops[0].destructive);
    }

    #[test]
    fn test_only_the_last_manager_removal_is_destructive() {
        let s = StateSnapshot::new("directory", "payments").with_manager("erin");
        let t = StateSnapshot::new("github", "org/payments")
            .with_manager("alice")
            .with_manager("bob")
            .with_manager("erin");
        assert!(compute(&s, &t).iter().all(|o| !o.destructive));

        let swap = StateSnapshot::new("directory", "payments").with_manager("carol");
        let flags: Vec<(String, bool)> = compute(&swap, &t)
            .iter()
            .map(|o| (o.to_string(), o.destructive))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("remove(alice, manager)".to_string(), false),
                ("remove(bob, manager)".to_string(), false),
                ("remove(erin, manager)".to_string(), true),
                ("add(carol, manager)".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_collapse_role_changes() {
        let options = DiffOptions {
            collapse_role_changes: true,
        };
        let ops = compute_with(&source(), &target(), options);
        let rendered: Vec<String> = ops.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "remove(dave, manager)",
                "remove(frank, member)",
                "update(carol, member -> maintainer)",
                "add(alice, manager)",
                "add(erin, member)",
            ]
        );
        let after = converge(&target(), &ops);
        assert_eq!(after.pairs(), source().pairs());
    }
}
