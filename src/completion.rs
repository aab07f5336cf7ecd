// src/completion.rs
//
// Turns backend clusters into the final assignment set. The backend only
// reports bins with two or more distinct values, so every extracted name it
// left out is assigned to itself here.

use log::warn;
use std::collections::{HashMap, HashSet};

use crate::models::{ClusterAssignment, ClusterGroup, InsertionMode};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionResult {
    pub assignments: Vec<ClusterAssignment>,
    /// Occurrences covered by backend groups plus fallback singletons.
    pub clustered_occurrences: u64,
    pub fallback_singletons: usize,
}

/// Builds one assignment per distinct extracted name.
///
/// Group members become `ServiceDerived` children of the group's first
/// member and contribute the backend's occurrence count. Names no group
/// mentions become `FallbackSingleton` self-assignments and contribute their
/// occurrence count in `all_names`, in first-seen order.
pub fn complete(groups: &[ClusterGroup], all_names: &[String]) -> CompletionResult {
    let mut occurrences: HashMap<&str, u64> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();
    for name in all_names {
        let count = occurrences.entry(name.as_str()).or_insert(0);
        if *count == 0 {
            first_seen.push(name.as_str());
        }
        *count += 1;
    }

    let mut result = CompletionResult::default();
    let mut assigned: HashSet<&str> = HashSet::new();

    for group in groups {
        // Representative must itself be a known name, otherwise the whole
        // group would hang off a parent that was never extracted.
        let Some(parent) = group
            .members
            .iter()
            .map(|m| m.value.as_str())
            .find(|v| occurrences.contains_key(v))
        else {
            if !group.is_empty() {
                warn!(
                    "Dropping cluster with no extracted members (representative '{}')",
                    group.members[0].value
                );
            }
            continue;
        };

        for member in &group.members {
            let value = member.value.as_str();
            let Some((&known, _)) = occurrences.get_key_value(value) else {
                warn!("Cluster member '{}' was not among the extracted names; dropped", value);
                continue;
            };
            if !assigned.insert(known) {
                warn!("Name '{}' appears in more than one cluster; keeping first assignment", value);
                continue;
            }
            result.clustered_occurrences += member.count;
            result
                .assignments
                .push(ClusterAssignment::new(parent, value, InsertionMode::ServiceDerived));
        }
    }

    for name in first_seen {
        if assigned.contains(name) {
            continue;
        }
        result.clustered_occurrences += occurrences[name];
        result.fallback_singletons += 1;
        result
            .assignments
            .push(ClusterAssignment::new(name, name, InsertionMode::FallbackSingleton));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterMember;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_grouped_and_singleton_names() {
        let groups = vec![ClusterGroup::new(vec![
            ClusterMember::new("Parafuso 3mm", 1),
            ClusterMember::new("parafuso 3mm", 1),
        ])];
        let all = names(&["Parafuso 3mm", "parafuso 3mm", "Prego 2pol"]);

        let result = complete(&groups, &all);
        assert_eq!(
            result.assignments,
            vec![
                ClusterAssignment::new("Parafuso 3mm", "Parafuso 3mm", InsertionMode::ServiceDerived),
                ClusterAssignment::new("Parafuso 3mm", "parafuso 3mm", InsertionMode::ServiceDerived),
                ClusterAssignment::new("Prego 2pol", "Prego 2pol", InsertionMode::FallbackSingleton),
            ]
        );
        assert_eq!(result.clustered_occurrences, 3);
        assert_eq!(result.fallback_singletons, 1);
    }

    #[test]
    fn test_exact_duplicates_collapse_to_one_singleton() {
        let all = names(&["Prego 2pol", "Prego 2pol", "Prego 2pol", "Serrote"]);
        let result = complete(&[], &all);

        assert_eq!(result.assignments.len(), 2);
        assert_eq!(result.assignments[0].child, "Prego 2pol");
        assert_eq!(result.assignments[1].child, "Serrote");
        assert_eq!(result.clustered_occurrences, 4);
        assert_eq!(result.fallback_singletons, 2);
    }

    #[test]
    fn test_unknown_members_are_dropped() {
        let groups = vec![ClusterGroup::new(vec![
            ClusterMember::new("ghost", 5),
            ClusterMember::new("alicate", 2),
            ClusterMember::new("ALICATE", 1),
        ])];
        let all = names(&["alicate", "alicate", "ALICATE"]);

        let result = complete(&groups, &all);
        assert_eq!(result.assignments.len(), 2);
        assert!(result.assignments.iter().all(|a| a.parent == "alicate"));
        assert_eq!(result.clustered_occurrences, 3);
    }

    #[test]
    fn test_every_name_assigned_once() {
        let groups = vec![
            ClusterGroup::new(vec![ClusterMember::new("ab", 1), ClusterMember::new("ba", 1)]),
            ClusterGroup::new(vec![ClusterMember::new("ba", 1), ClusterMember::new("Ba", 1)]),
        ];
        let all = names(&["ab", "ba", "Ba", "cd"]);

        let result = complete(&groups, &all);
        let children: Vec<&str> = result.assignments.iter().map(|a| a.child.as_str()).collect();
        assert_eq!(children, vec!["ab", "ba", "Ba", "cd"]);
        assert_eq!(result.assignments[2].parent, "ba");
        assert_eq!(result.clustered_occurrences, 4);
    }

    #[test]
    fn test_delta_surfaces_count_mismatch() {
        // Backend reports more occurrences than were extracted.
        let groups = vec![ClusterGroup::new(vec![
            ClusterMember::new("lixa", 3),
            ClusterMember::new("LIXA", 1),
        ])];
        let all = names(&["lixa", "LIXA"]);
        let result = complete(&groups, &all);
        assert_eq!(result.clustered_occurrences, 4);
        assert_ne!(result.clustered_occurrences as usize, all.len());
    }
}
