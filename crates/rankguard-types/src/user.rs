use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group::group_key;
use crate::scope::ScopedAttributes;

/// Which user identity is authoritative in a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Users are keyed by their 128-bit id.
    #[default]
    Uuid,
    /// Users are keyed by their (case-insensitive) name.
    Name,
}

/// Lookup key for a user.
///
/// Either form can be used for lookups in either mode; the registry only
/// indexes by the authoritative one and scans for the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum UserKey {
    Id(Uuid),
    Name(String),
}

impl UserKey {
    /// Canonical string used by the registry index and by file backends.
    pub fn storage_key(&self) -> String {
        match self {
            UserKey::Id(id) => id.hyphenated().to_string(),
            UserKey::Name(name) => name.trim().to_lowercase(),
        }
    }
}

impl From<Uuid> for UserKey {
    fn from(id: Uuid) -> Self {
        UserKey::Id(id)
    }
}

impl From<&str> for UserKey {
    fn from(name: &str) -> Self {
        UserKey::Name(name.to_string())
    }
}

impl From<String> for UserKey {
    fn from(name: String) -> Self {
        UserKey::Name(name)
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKey::Id(id) => write!(f, "{id}"),
            UserKey::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A user and everything assigned directly to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    /// Names of the groups the user is a direct member of, in assignment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Materialized on first sight instead of loaded from the backend.
    #[serde(skip)]
    pub is_temporary: bool,
    #[serde(flatten)]
    pub scoped: ScopedAttributes,
}

impl User {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            groups: Vec::new(),
            is_temporary: false,
            scoped: ScopedAttributes::default(),
        }
    }

    /// The authoritative key for this user under `mode`.
    pub fn key(&self, mode: IdentityMode) -> UserKey {
        match mode {
            IdentityMode::Uuid => UserKey::Id(self.id),
            IdentityMode::Name => UserKey::Name(self.name.clone()),
        }
    }

    /// Whether `key` identifies this user (names compare case-insensitively).
    pub fn matches(&self, key: &UserKey) -> bool {
        match key {
            UserKey::Id(id) => &self.id == id,
            UserKey::Name(name) => self.name.to_lowercase() == name.trim().to_lowercase(),
        }
    }

    /// Whether the user is a direct member of `group`.
    pub fn in_group(&self, group: &str) -> bool {
        let key = group_key(group);
        self.groups.iter().any(|g| group_key(g) == key)
    }

    /// Anything worth keeping: a membership, a permission or a display value.
    pub fn has_customization(&self) -> bool {
        !self.groups.is_empty() || !self.scoped.is_empty()
    }
}
