//! Inheritance resolution over a registry snapshot.
//!
//! Inheritance is stored by group name and resolved on use. [`validate`]
//! repairs the graph after a load: it drops references that do not resolve,
//! self references, duplicates and every edge that closes a cycle, so the
//! remaining inheritance relation is a DAG over existing groups. The ladder,
//! default-group and main-group queries are pure functions over a snapshot.

use std::collections::{BTreeMap, HashSet, VecDeque};

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{DfsEvent, depth_first_search};

use rankguard_types::group::{Group, group_key};
use rankguard_types::user::{User, UserKey};

use crate::registry::Snapshot;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Repairs made by [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// `(group, parent)` references that were dangling, self or duplicate.
    pub dropped_inheritances: Vec<(String, String)>,
    /// `(group, parent)` edges removed because they closed a cycle.
    pub broken_cycles: Vec<(String, String)>,
    /// `(user, group)` memberships that did not resolve or were duplicates.
    pub dropped_memberships: Vec<(UserKey, String)>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.repairs() == 0
    }

    pub fn repairs(&self) -> usize {
        self.dropped_inheritances.len() + self.broken_cycles.len() + self.dropped_memberships.len()
    }
}

/// Repair the inheritance graph and every cached membership in place.
pub fn validate(snapshot: &mut Snapshot) -> ValidationReport {
    let mut report = ValidationReport::default();
    let known: HashSet<String> = snapshot.groups().map(Group::key).collect();

    for group in snapshot.groups_mut() {
        let own = group.key();
        let mut seen = HashSet::new();
        let name = group.name.clone();
        group.inheritances.retain(|parent| {
            let key = group_key(parent);
            let keep = key != own && known.contains(&key) && seen.insert(key);
            if !keep {
                report.dropped_inheritances.push((name.clone(), parent.clone()));
            }
            keep
        });
    }

    // Depth-first from every group in key order; a back edge closes a cycle.
    let edges = inheritance_edges(snapshot);
    let graph = inheritance_graph(&edges);
    let mut back_edges = Vec::new();
    depth_first_search(&graph, edges.keys().map(String::as_str), |event| {
        if let DfsEvent::BackEdge(child, parent) = event {
            back_edges.push((child.to_string(), parent.to_string()));
        }
    });
    for (child, parent) in back_edges {
        if let Some(group) = snapshot.group_mut(&child) {
            group.inheritances.retain(|i| group_key(i) != parent);
            report.broken_cycles.push((group.name.clone(), parent));
        }
    }

    let mode = snapshot.mode();
    for user in snapshot.users_mut() {
        let key = user.key(mode);
        for group in prune_memberships(&known, user) {
            report.dropped_memberships.push((key.clone(), group));
        }
    }

    report
}

/// Group key to the keys of its resolvable parents, in declaration order.
fn inheritance_edges(snapshot: &Snapshot) -> BTreeMap<String, Vec<String>> {
    snapshot
        .groups()
        .map(|g| {
            let parents = g
                .inheritances
                .iter()
                .filter(|i| snapshot.contains_group(i))
                .map(|i| group_key(i))
                .collect();
            (g.key(), parents)
        })
        .collect()
}

/// Child-to-parent graph over group keys.
fn inheritance_graph(edges: &BTreeMap<String, Vec<String>>) -> DiGraphMap<&str, ()> {
    let mut graph = DiGraphMap::new();
    for key in edges.keys() {
        graph.add_node(key.as_str());
    }
    for (child, parents) in edges {
        for parent in parents {
            graph.add_edge(child.as_str(), parent.as_str(), ());
        }
    }
    graph
}

/// Drop inheritances of a group about to be inserted into `snapshot`.
///
/// Removes dangling, self and duplicate references and every parent that
/// already inherits from `group`. Returns the dropped names.
pub fn validate_group(snapshot: &Snapshot, group: &mut Group) -> Vec<String> {
    let own = group.key();
    let mut seen = HashSet::new();
    let mut dropped = Vec::new();
    group.inheritances.retain(|parent| {
        let key = group_key(parent);
        let keep = key != own
            && snapshot.contains_group(parent)
            && !would_create_cycle(snapshot, &own, parent)
            && seen.insert(key);
        if !keep {
            dropped.push(parent.clone());
        }
        keep
    });
    dropped
}

/// Drop memberships of `user` that do not resolve in `snapshot`.
///
/// Used on users loaded lazily after the last full validation. Returns the
/// dropped group names.
pub fn validate_user(snapshot: &Snapshot, user: &mut User) -> Vec<String> {
    let known: HashSet<String> = snapshot.groups().map(Group::key).collect();
    prune_memberships(&known, user)
}

fn prune_memberships(known: &HashSet<String>, user: &mut User) -> Vec<String> {
    let mut dropped = Vec::new();
    let mut seen = HashSet::new();
    user.groups.retain(|group| {
        let key = group_key(group);
        let keep = known.contains(&key) && seen.insert(key);
        if !keep {
            dropped.push(group.clone());
        }
        keep
    });
    dropped
}

/// Whether adding `parent` to `group`'s inheritances would close a cycle.
///
/// True when `parent` already reaches `group` through inheritance.
pub fn would_create_cycle(snapshot: &Snapshot, group: &str, parent: &str) -> bool {
    let key = group_key(group);
    let parent_key = group_key(parent);
    if parent_key == key {
        return true;
    }
    if !snapshot.contains_group(&parent_key) || !snapshot.contains_group(&key) {
        return false;
    }
    let edges = inheritance_edges(snapshot);
    let graph = inheritance_graph(&edges);
    has_path_connecting(&graph, parent_key.as_str(), key.as_str(), None)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn same_ladder(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// The group on `group`'s ladder with the greatest rank strictly below it.
///
/// Equal ranks resolve to the first group in name order.
pub fn next_group<'a>(snapshot: &'a Snapshot, group: &Group) -> Option<&'a Group> {
    snapshot
        .groups()
        .filter(|g| same_ladder(&g.ladder, &group.ladder) && g.rank < group.rank)
        .fold(None, |best: Option<&Group>, g| match best {
            Some(b) if b.rank >= g.rank => Some(b),
            _ => Some(g),
        })
}

/// The group on `group`'s ladder with the least rank strictly above it.
pub fn previous_group<'a>(snapshot: &'a Snapshot, group: &Group) -> Option<&'a Group> {
    snapshot
        .groups()
        .filter(|g| same_ladder(&g.ladder, &group.ladder) && g.rank > group.rank)
        .fold(None, |best: Option<&Group>, g| match best {
            Some(b) if b.rank <= g.rank => Some(b),
            _ => Some(g),
        })
}

/// Every group on `ladder`, ordered by rank then name.
pub fn ladder_groups<'a>(snapshot: &'a Snapshot, ladder: &str) -> Vec<&'a Group> {
    let mut groups: Vec<&Group> = snapshot
        .groups()
        .filter(|g| same_ladder(&g.ladder, ladder))
        .collect();
    groups.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.key().cmp(&b.key())));
    groups
}

/// Distinct ladder names, sorted. Spelling follows the first group seen.
pub fn ladders(snapshot: &Snapshot) -> Vec<String> {
    let mut ladders = BTreeMap::new();
    for group in snapshot.groups() {
        ladders
            .entry(group.ladder.to_lowercase())
            .or_insert_with(|| group.ladder.clone());
    }
    ladders.into_values().collect()
}

/// Groups flagged as default. The flag is never inherited.
pub fn default_groups(snapshot: &Snapshot) -> Vec<&Group> {
    snapshot.groups().filter(|g| g.is_default).collect()
}

/// The heaviest of `user`'s directly assigned groups.
///
/// Equal weights resolve to the group listed first on the user.
pub fn main_group<'a>(snapshot: &'a Snapshot, user: &User) -> Option<&'a Group> {
    user.groups
        .iter()
        .filter_map(|name| snapshot.group(name))
        .fold(None, |best: Option<&Group>, g| match best {
            Some(b) if b.weight >= g.weight => Some(b),
            _ => Some(g),
        })
}

/// Every group `group` inherits from, directly or transitively.
///
/// Breadth-first, de-duplicated, never containing `group` itself.
/// Unresolvable names are skipped.
pub fn inheritance_chain<'a>(snapshot: &'a Snapshot, group: &Group) -> Vec<&'a Group> {
    let mut visited = HashSet::from([group.key()]);
    let mut queue: VecDeque<&str> = group.inheritances.iter().map(String::as_str).collect();
    let mut chain = Vec::new();

    while let Some(name) = queue.pop_front() {
        let Some(parent) = snapshot.group(name) else {
            continue;
        };
        if !visited.insert(parent.key()) {
            continue;
        }
        queue.extend(parent.inheritances.iter().map(String::as_str));
        chain.push(parent);
    }
    chain
}
