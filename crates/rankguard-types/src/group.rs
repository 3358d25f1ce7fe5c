use serde::{Deserialize, Serialize};

use crate::scope::ScopedAttributes;

/// Ladder assigned to groups that never set one.
pub const DEFAULT_LADDER: &str = "default";

/// Weight assigned to freshly constructed groups.
pub const DEFAULT_WEIGHT: i32 = 20;

/// Canonical lookup key for a group name (names are case-insensitive).
pub fn group_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A named permission group.
///
/// Inheritance is stored by *name* and resolved against the registry on
/// every use, so a group may refer to a parent that is not (yet) loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Names of the groups this group inherits from, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritances: Vec<String>,
    /// Position within `ladder`.
    #[serde(default)]
    pub rank: i32,
    /// Only used to pick a user's main group.
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_ladder")]
    pub ladder: String,
    /// Auto-assigned to newly created users. Never inherited.
    #[serde(default)]
    pub is_default: bool,
    #[serde(flatten)]
    pub scoped: ScopedAttributes,
}

fn default_weight() -> i32 {
    DEFAULT_WEIGHT
}

fn default_ladder() -> String {
    DEFAULT_LADDER.to_string()
}

impl Group {
    /// Create an empty group on the default ladder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            inheritances: Vec::new(),
            rank: 0,
            weight: DEFAULT_WEIGHT,
            ladder: default_ladder(),
            is_default: false,
            scoped: ScopedAttributes::default(),
        }
    }

    pub fn with_ladder(mut self, ladder: impl Into<String>) -> Self {
        self.ladder = ladder.into();
        self
    }

    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_inheritance(mut self, parent: impl Into<String>) -> Self {
        self.inheritances.push(parent.into());
        self
    }

    /// Lowercased registry key.
    pub fn key(&self) -> String {
        group_key(&self.name)
    }

    /// Whether `name` is listed as a direct parent (case-insensitive).
    pub fn inherits(&self, name: &str) -> bool {
        let key = group_key(name);
        self.inheritances.iter().any(|i| group_key(i) == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_group_has_defaults() {
        let group = Group::new(" Admin ");
        assert_eq!(group.name, "Admin");
        assert_eq!(group.key(), "admin");
        assert_eq!(group.ladder, DEFAULT_LADDER);
        assert_eq!(group.weight, DEFAULT_WEIGHT);
        assert_eq!(group.rank, 0);
        assert!(!group.is_default);
    }

    #[test]
    fn inherits_is_case_insensitive() {
        let group = Group::new("mod").with_inheritance("Member");
        assert!(group.inherits("member"));
        assert!(!group.inherits("admin"));
    }

    #[test]
    fn deserialize_fills_missing_fields() {
        let group: Group = serde_json::from_str(r#"{"name":"guest","perms":["chat.use"]}"#).unwrap();
        assert_eq!(group.ladder, DEFAULT_LADDER);
        assert_eq!(group.weight, DEFAULT_WEIGHT);
        assert_eq!(group.scoped.global.perms, vec!["chat.use".to_string()]);
    }

    #[test]
    fn yaml_roundtrip_keeps_server_layers() {
        let mut group = Group::new("builder").with_rank(10);
        group
            .scoped
            .at_mut(&crate::scope::Scope::world("creative", "plots"))
            .add_perm("worldedit.*");

        let yaml = serde_yaml_ng::to_string(&group).unwrap();
        let back: Group = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, group);
    }
}
