//! Scoped permission evaluation.
//!
//! Evaluation collects the entries that apply in a [`PermissionContext`]:
//! the user's own layers first, then every group reachable through the
//! user's memberships and their inheritances, breadth-first. A matching
//! negation anywhere denies; otherwise one matching grant is enough.

use std::collections::{HashSet, VecDeque};

use rankguard_types::group::Group;
use rankguard_types::scope::{
    Attributes, DisplayField, NEGATION_PREFIX, PermissionContext, normalize_permission,
};
use rankguard_types::user::User;

use crate::matcher::{PermissionMatcher, matcher_for};
use crate::registry::Snapshot;
use crate::resolver;

/// Resolved display, prefix and suffix of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayAttributes {
    pub display: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

/// Answers permission checks against a registry snapshot.
#[derive(Debug)]
pub struct PermissionEvaluator {
    matcher: Box<dyn PermissionMatcher>,
}

impl PermissionEvaluator {
    pub fn new(matcher: Box<dyn PermissionMatcher>) -> Self {
        Self { matcher }
    }

    /// Evaluator with the wildcard or regex matcher.
    pub fn with_regex(use_regex: bool) -> Self {
        Self::new(matcher_for(use_regex))
    }

    /// Whether `user` holds `permission` in `context`.
    pub fn evaluate(
        &self,
        snapshot: &Snapshot,
        user: &User,
        permission: &str,
        context: &PermissionContext,
    ) -> bool {
        let permission = normalize_permission(permission).to_lowercase();
        if permission.is_empty() {
            return false;
        }

        let mut granted = false;
        for entry in applicable_entries(snapshot, user, context) {
            match entry.strip_prefix(NEGATION_PREFIX) {
                Some(revoked) => {
                    if self.matcher.matches(revoked, &permission) {
                        return false;
                    }
                }
                None => granted = granted || self.matcher.matches(entry, &permission),
            }
        }
        granted
    }

    /// Every entry that applies to `user` in `context`, own entries first.
    pub fn effective_permissions(
        &self,
        snapshot: &Snapshot,
        user: &User,
        context: &PermissionContext,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        applicable_entries(snapshot, user, context)
            .into_iter()
            .filter(|entry| seen.insert(*entry))
            .map(str::to_string)
            .collect()
    }

    /// The most specific display, prefix and suffix for `user` in `context`.
    ///
    /// The user's own values win; missing ones fall back to the main group.
    pub fn display_attributes(
        &self,
        snapshot: &Snapshot,
        user: &User,
        context: &PermissionContext,
    ) -> DisplayAttributes {
        let own = user.scoped.layers(context);
        let main = resolver::main_group(snapshot, user)
            .map(|g| g.scoped.layers(context))
            .unwrap_or_default();
        let pick = |field| most_specific(&own, field).or_else(|| most_specific(&main, field));

        DisplayAttributes {
            display: pick(DisplayField::Display),
            prefix: pick(DisplayField::Prefix),
            suffix: pick(DisplayField::Suffix),
        }
    }
}

fn most_specific(layers: &[&Attributes], field: DisplayField) -> Option<String> {
    layers
        .iter()
        .rev()
        .filter_map(|layer| layer.get(field))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Entries from the user's layers, then from each reachable group once.
fn applicable_entries<'a>(
    snapshot: &'a Snapshot,
    user: &'a User,
    context: &PermissionContext,
) -> Vec<&'a str> {
    let mut entries: Vec<&str> = user
        .scoped
        .layers(context)
        .into_iter()
        .flat_map(|layer| layer.perms.iter().map(String::as_str))
        .collect();

    let mut visited = HashSet::new();
    let mut queue: VecDeque<&str> = user.groups.iter().map(String::as_str).collect();
    while let Some(name) = queue.pop_front() {
        let Some(group) = snapshot.group(name) else {
            continue;
        };
        if !visited.insert(group.key()) {
            continue;
        }
        entries.extend(group_entries(group, context));
        queue.extend(group.inheritances.iter().map(String::as_str));
    }
    entries
}

fn group_entries<'a>(group: &'a Group, context: &PermissionContext) -> impl Iterator<Item = &'a str> {
    group
        .scoped
        .layers(context)
        .into_iter()
        .flat_map(|layer| layer.perms.iter().map(String::as_str))
}
