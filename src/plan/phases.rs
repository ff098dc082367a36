//! Phase construction from a flat, dependency-annotated work-item list.
//!
//! Grouping is driven by `execution_order` and `parallel_group` alone;
//! the declared `dependencies` are checked separately by
//! [`dependency_warnings`] and never influence the grouping.

use std::collections::{HashMap, HashSet};

use crate::tracker::WorkItem;

/// An ordered group of work items run together.
///
/// Derived fresh per scheduling pass; never persisted.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Execution order shared by every item in the phase.
    pub execution_order: u32,
    /// Whether the items run concurrently. Only set when more than one
    /// item shares a parallel group at this order.
    pub can_run_in_parallel: bool,
    /// Items in the phase, in declared order.
    pub items: Vec<WorkItem>,
}

/// Group items into an ordered phase sequence.
///
/// Items are stable-sorted by `execution_order`. Within one order,
/// items sharing a non-null `parallel_group` (with `can_parallelize`
/// set) form a single phase, emitted at the position of the group's
/// first member; every other item becomes its own sequential phase, in
/// insertion order. The output is non-decreasing in `execution_order`.
#[must_use]
pub fn build_phases(items: &[WorkItem]) -> Vec<Phase> {
    let mut ordered: Vec<&WorkItem> = items.iter().collect();
    ordered.sort_by_key(|item| item.execution_order);

    let mut phases = Vec::new();
    let mut index = 0;

    while index < ordered.len() {
        let order = ordered[index].execution_order;
        let mut group_end = index;
        while group_end < ordered.len() && ordered[group_end].execution_order == order {
            group_end += 1;
        }
        let peers = &ordered[index..group_end];

        let mut emitted_groups: HashSet<&str> = HashSet::new();
        for item in peers {
            match item.parallel_group.as_deref() {
                Some(tag) if item.can_parallelize => {
                    if !emitted_groups.insert(tag) {
                        continue;
                    }
                    let members: Vec<WorkItem> = peers
                        .iter()
                        .filter(|peer| {
                            peer.can_parallelize && peer.parallel_group.as_deref() == Some(tag)
                        })
                        .map(|peer| (*peer).clone())
                        .collect();
                    let parallel = members.len() > 1;
                    phases.push(Phase {
                        execution_order: order,
                        can_run_in_parallel: parallel,
                        items: members,
                    });
                }
                _ => phases.push(Phase {
                    execution_order: order,
                    can_run_in_parallel: false,
                    items: vec![(*item).clone()],
                }),
            }
        }

        index = group_end;
    }

    phases
}

/// Check that every declared dependency exists and runs strictly before
/// its dependent. Violations come back as warnings — the plan still
/// runs, ordered by `execution_order`.
#[must_use]
pub fn dependency_warnings(items: &[WorkItem]) -> Vec<String> {
    let orders: HashMap<&str, u32> = items
        .iter()
        .map(|item| (item.id.as_str(), item.execution_order))
        .collect();

    let mut warnings = Vec::new();
    for item in items {
        for dependency in &item.dependencies {
            match orders.get(dependency.as_str()) {
                None => warnings.push(format!(
                    "item {} depends on unknown item {dependency}",
                    item.id
                )),
                Some(&dep_order) if dep_order >= item.execution_order => {
                    warnings.push(format!(
                        "item {} (order {}) depends on {dependency} (order {dep_order}), \
                         which does not run earlier",
                        item.id, item.execution_order
                    ));
                }
                Some(_) => {}
            }
        }
    }
    warnings
}
