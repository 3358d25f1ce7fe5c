//! Permission entry matching strategies.
//!
//! The evaluator is built with exactly one [`PermissionMatcher`], chosen from
//! configuration: segment wildcards by default, anchored regular expressions
//! when `use_regex_perms` is set. Entries reach the matcher without their
//! negation marker.

use std::fmt;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};

/// Decides whether one stored permission entry covers a queried permission.
pub trait PermissionMatcher: Send + Sync + fmt::Debug {
    fn matches(&self, entry: &str, permission: &str) -> bool;
}

/// Pick the matching strategy once, at evaluator construction.
pub fn matcher_for(use_regex: bool) -> Box<dyn PermissionMatcher> {
    if use_regex {
        Box::new(RegexMatcher::new())
    } else {
        Box::new(WildcardMatcher)
    }
}

// ---------------------------------------------------------------------------
// WildcardMatcher
// ---------------------------------------------------------------------------

/// Dot-segment comparison where a `*` segment covers the remainder.
///
/// `*` matches every permission, `chat.*` matches `chat.use` and
/// `chat.color.red` but not `chat` itself. Without a `*` segment both sides
/// need the same number of segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct WildcardMatcher;

impl PermissionMatcher for WildcardMatcher {
    fn matches(&self, entry: &str, permission: &str) -> bool {
        let mut entry_segments = entry.split('.');
        let mut permission_segments = permission.split('.');
        loop {
            match (entry_segments.next(), permission_segments.next()) {
                (Some("*"), Some(_)) => return true,
                (Some(e), Some(p)) if e.eq_ignore_ascii_case(p) => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RegexMatcher
// ---------------------------------------------------------------------------

/// Treats every entry as an anchored, case-insensitive regular expression.
///
/// Compiled patterns are cached per entry. An entry that does not compile is
/// cached as `None` and compared literally from then on.
#[derive(Debug, Default)]
pub struct RegexMatcher {
    cache: DashMap<String, Option<Regex>>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, entry: &str) -> Option<Regex> {
        if let Some(cached) = self.cache.get(entry) {
            return cached.value().clone();
        }

        let compiled = match RegexBuilder::new(&format!("^(?:{entry})$"))
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(err) => {
                tracing::debug!(entry, error = %err, "permission entry is not a valid pattern, comparing literally");
                None
            }
        };
        self.cache.insert(entry.to_string(), compiled.clone());
        compiled
    }

    /// Number of distinct entries seen so far.
    pub fn cached_patterns(&self) -> usize {
        self.cache.len()
    }
}

impl PermissionMatcher for RegexMatcher {
    fn matches(&self, entry: &str, permission: &str) -> bool {
        match self.compiled(entry) {
            Some(regex) => regex.is_match(permission),
            None => entry.eq_ignore_ascii_case(permission),
        }
    }
}
