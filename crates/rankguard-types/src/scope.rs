//! Scoped attributes and evaluation context.
//!
//! Every group and user carries permissions and display attributes at three
//! granularities: global, per-server and per-server-per-world. The same
//! [`ScopedAttributes`] shape is shared by both entity kinds and by every
//! storage backend.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Leading marker of a permission entry that revokes instead of grants.
pub const NEGATION_PREFIX: char = '-';

/// Normalize a permission entry for storage.
///
/// Only surrounding whitespace is removed. Case is kept because a regex
/// entry such as `\D` means something else once lowercased; both matchers
/// compare case-insensitively.
pub fn normalize_permission(perm: &str) -> String {
    perm.trim().to_string()
}

/// Whether two permission entries name the same entry.
pub fn same_permission(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The granularity at which a permission or display attribute is defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Server(String),
    World { server: String, world: String },
}

impl Scope {
    pub fn server(server: impl Into<String>) -> Self {
        Scope::Server(server.into())
    }

    pub fn world(server: impl Into<String>, world: impl Into<String>) -> Self {
        Scope::World {
            server: server.into(),
            world: world.into(),
        }
    }

    /// Build a scope from optional server/world parts.
    ///
    /// A world without a server has no meaning and collapses to `Global`.
    pub fn from_parts(server: Option<&str>, world: Option<&str>) -> Self {
        match (server, world) {
            (Some(server), Some(world)) => Scope::world(server, world),
            (Some(server), None) => Scope::server(server),
            (None, _) => Scope::Global,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Server(server) => write!(f, "server:{server}"),
            Scope::World { server, world } => write!(f, "server:{server}/world:{world}"),
        }
    }
}

// ---------------------------------------------------------------------------
// PermissionContext
// ---------------------------------------------------------------------------

/// Where a permission check is being evaluated.
///
/// With no server only global entries apply; a world is only meaningful
/// together with a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<String>,
}

impl PermissionContext {
    /// Context without any server, i.e. global entries only.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn server(server: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            world: None,
        }
    }

    pub fn world(server: impl Into<String>, world: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            world: Some(world.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// The three display-style string attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayField {
    Display,
    Prefix,
    Suffix,
}

impl fmt::Display for DisplayField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayField::Display => write!(f, "display"),
            DisplayField::Prefix => write!(f, "prefix"),
            DisplayField::Suffix => write!(f, "suffix"),
        }
    }
}

/// Permissions and display attributes at a single scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl Attributes {
    /// True when nothing at all is set at this scope.
    pub fn is_empty(&self) -> bool {
        self.perms.is_empty()
            && self.display.is_none()
            && self.prefix.is_none()
            && self.suffix.is_none()
    }

    pub fn get(&self, field: DisplayField) -> Option<&str> {
        match field {
            DisplayField::Display => self.display.as_deref(),
            DisplayField::Prefix => self.prefix.as_deref(),
            DisplayField::Suffix => self.suffix.as_deref(),
        }
    }

    /// Set or clear a display attribute. Empty strings clear.
    pub fn set(&mut self, field: DisplayField, value: Option<String>) {
        let value = value.filter(|v| !v.is_empty());
        match field {
            DisplayField::Display => self.display = value,
            DisplayField::Prefix => self.prefix = value,
            DisplayField::Suffix => self.suffix = value,
        }
    }

    /// Add a permission entry. Returns `false` if it was already present.
    pub fn add_perm(&mut self, perm: &str) -> bool {
        let perm = normalize_permission(perm);
        if perm.is_empty() || self.perms.iter().any(|p| same_permission(p, &perm)) {
            return false;
        }
        self.perms.push(perm);
        true
    }

    /// Remove a permission entry. Returns `false` if it was not present.
    pub fn remove_perm(&mut self, perm: &str) -> bool {
        let perm = normalize_permission(perm);
        let before = self.perms.len();
        self.perms.retain(|p| !same_permission(p, &perm));
        self.perms.len() != before
    }
}

/// Attributes of one server plus its per-world overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerScope {
    #[serde(flatten)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub worlds: BTreeMap<String, Attributes>,
}

impl ServerScope {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.worlds.values().all(Attributes::is_empty)
    }
}

/// Global attributes plus the per-server and per-server-per-world layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedAttributes {
    #[serde(flatten)]
    pub global: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers: BTreeMap<String, ServerScope>,
}

impl ScopedAttributes {
    /// Attributes defined exactly at `scope`, if any.
    pub fn at(&self, scope: &Scope) -> Option<&Attributes> {
        match scope {
            Scope::Global => Some(&self.global),
            Scope::Server(server) => self.servers.get(server).map(|s| &s.attributes),
            Scope::World { server, world } => self
                .servers
                .get(server)
                .and_then(|s| s.worlds.get(world)),
        }
    }

    /// Mutable attributes at `scope`, creating the server/world entry on demand.
    pub fn at_mut(&mut self, scope: &Scope) -> &mut Attributes {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Server(server) => &mut self.servers.entry(server.clone()).or_default().attributes,
            Scope::World { server, world } => self
                .servers
                .entry(server.clone())
                .or_default()
                .worlds
                .entry(world.clone())
                .or_default(),
        }
    }

    /// Drop server and world entries that no longer hold anything.
    pub fn prune(&mut self) {
        for server in self.servers.values_mut() {
            server.worlds.retain(|_, w| !w.is_empty());
        }
        self.servers.retain(|_, s| !s.is_empty());
    }

    /// True when no scope holds a permission or display attribute.
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.servers.values().all(ServerScope::is_empty)
    }

    /// The layers that apply in `context`, most general first.
    ///
    /// Global always applies; the server layer only when `context.server`
    /// names it exactly; the world layer only when both server and world
    /// match exactly.
    pub fn layers(&self, context: &PermissionContext) -> Vec<&Attributes> {
        let mut layers = vec![&self.global];
        let Some(server_name) = context.server.as_deref() else {
            return layers;
        };
        if let Some(server) = self.servers.get(server_name) {
            layers.push(&server.attributes);
            if let Some(world) = context.world.as_deref().and_then(|w| server.worlds.get(w)) {
                layers.push(world);
            }
        }
        layers
    }
}
