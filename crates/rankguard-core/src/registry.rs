//! In-memory store of groups and cached users.
//!
//! The registry is the sole owner of every `Group` and `User`. It publishes
//! an immutable [`Snapshot`] behind an `Arc`: readers clone the `Arc` and
//! work lock-free, writers mutate copy-on-write under a short write lock,
//! and full reloads swap in a freshly built snapshot in one step. A reader
//! therefore always sees either the old or the new dataset, never a mix.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use rankguard_types::group::{Group, group_key};
use rankguard_types::user::{IdentityMode, User, UserKey};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A consistent view of every group and every cached user.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    mode: IdentityMode,
    /// Keyed by lowercased group name.
    groups: BTreeMap<String, Group>,
    /// Keyed by the storage key of the authoritative user identity.
    users: HashMap<String, User>,
}

/// What a cascading group removal touched.
#[derive(Debug, Clone)]
pub struct RemovedGroup {
    pub group: Group,
    /// Groups whose inheritance list referenced the removed group.
    pub inheriting_groups: Vec<String>,
    /// Cached users that were members of the removed group.
    pub members: Vec<UserKey>,
}

impl Snapshot {
    pub fn new(mode: IdentityMode) -> Self {
        Self {
            mode,
            groups: BTreeMap::new(),
            users: HashMap::new(),
        }
    }

    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    // -- groups -------------------------------------------------------------

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(&group_key(name))
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(&group_key(name))
    }

    pub fn contains_group(&self, name: &str) -> bool {
        self.groups.contains_key(&group_key(name))
    }

    /// All groups ordered by lowercased name.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn groups_mut(&mut self) -> impl Iterator<Item = &mut Group> {
        self.groups.values_mut()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Insert or replace a group, returning the previous one.
    pub fn insert_group(&mut self, group: Group) -> Option<Group> {
        self.groups.insert(group.key(), group)
    }

    /// Drop every group, leaving user memberships dangling until validated.
    pub fn clear_groups(&mut self) {
        self.groups.clear();
    }

    /// Remove a group together with every reference to it.
    ///
    /// The group disappears from all inheritance lists and from the
    /// membership list of every cached user in the same call.
    pub fn remove_group(&mut self, name: &str) -> Option<RemovedGroup> {
        let key = group_key(name);
        let group = self.groups.remove(&key)?;

        let mut inheriting_groups = Vec::new();
        for other in self.groups.values_mut() {
            let before = other.inheritances.len();
            other.inheritances.retain(|i| group_key(i) != key);
            if other.inheritances.len() != before {
                inheriting_groups.push(other.name.clone());
            }
        }

        let mut members = Vec::new();
        for user in self.users.values_mut() {
            let before = user.groups.len();
            user.groups.retain(|g| group_key(g) != key);
            if user.groups.len() != before {
                members.push(user.key(self.mode));
            }
        }

        Some(RemovedGroup {
            group,
            inheriting_groups,
            members,
        })
    }

    // -- users --------------------------------------------------------------

    /// Index key for `key`, when it is of the authoritative kind.
    fn index_key(&self, key: &UserKey) -> Option<String> {
        match (self.mode, key) {
            (IdentityMode::Uuid, UserKey::Id(_)) | (IdentityMode::Name, UserKey::Name(_)) => {
                Some(key.storage_key())
            }
            _ => None,
        }
    }

    fn locate(&self, key: &UserKey) -> Option<String> {
        match self.index_key(key) {
            Some(index) => self.users.contains_key(&index).then_some(index),
            None => self
                .users
                .iter()
                .find(|(_, user)| user.matches(key))
                .map(|(index, _)| index.clone()),
        }
    }

    pub fn user(&self, key: &UserKey) -> Option<&User> {
        match self.index_key(key) {
            Some(index) => self.users.get(&index),
            None => self.users.values().find(|user| user.matches(key)),
        }
    }

    pub fn user_mut(&mut self, key: &UserKey) -> Option<&mut User> {
        let index = self.locate(key)?;
        self.users.get_mut(&index)
    }

    pub fn contains_user(&self, key: &UserKey) -> bool {
        self.user(key).is_some()
    }

    /// All cached users, in no particular order.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn users_mut(&mut self) -> impl Iterator<Item = &mut User> {
        self.users.values_mut()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Insert or replace a user, returning the previous one.
    pub fn insert_user(&mut self, user: User) -> Option<User> {
        let index = user.key(self.mode).storage_key();
        self.users.insert(index, user)
    }

    pub fn remove_user(&mut self, key: &UserKey) -> Option<User> {
        let index = self.locate(key)?;
        self.users.remove(&index)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared handle publishing the current [`Snapshot`].
#[derive(Debug)]
pub struct Registry {
    state: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new(mode: IdentityMode) -> Self {
        Self {
            state: RwLock::new(Arc::new(Snapshot::new(mode))),
        }
    }

    pub fn mode(&self) -> IdentityMode {
        self.state.read().mode()
    }

    /// The current snapshot. Holding it never blocks writers.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.state.read())
    }

    /// Apply an in-memory change.
    ///
    /// The snapshot is cloned first if readers still hold it, so they keep
    /// seeing the state from before the change. Never perform I/O in `f`.
    pub fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut state = self.state.write();
        f(Arc::make_mut(&mut state))
    }

    /// Swap in a complete new snapshot, returning the previous one.
    pub fn replace(&self, next: Snapshot) -> Arc<Snapshot> {
        std::mem::replace(&mut *self.state.write(), Arc::new(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user_in(name: &str, groups: &[&str]) -> User {
        let mut user = User::new(Uuid::now_v7(), name);
        user.groups = groups.iter().map(|g| g.to_string()).collect();
        user
    }

    #[test]
    fn group_lookup_is_case_insensitive() {
        let mut snapshot = Snapshot::new(IdentityMode::Uuid);
        snapshot.insert_group(Group::new("Admin"));
        assert!(snapshot.group("admin").is_some());
        assert!(snapshot.group("ADMIN").is_some());
        assert!(snapshot.group("mod").is_none());
    }

    #[test]
    fn remove_group_cascades_to_groups_and_users() {
        let mut snapshot = Snapshot::new(IdentityMode::Uuid);
        snapshot.insert_group(Group::new("base"));
        snapshot.insert_group(Group::new("vip").with_inheritance("Base"));
        snapshot.insert_group(Group::new("staff").with_inheritance("vip"));
        let member = user_in("Steve", &["base", "staff"]);
        let member_key = member.key(IdentityMode::Uuid);
        snapshot.insert_user(member);

        let removed = snapshot.remove_group("BASE").unwrap();
        assert_eq!(removed.group.name, "base");
        assert_eq!(removed.inheriting_groups, vec!["vip".to_string()]);
        assert_eq!(removed.members, vec![member_key.clone()]);

        assert!(snapshot.group("vip").unwrap().inheritances.is_empty());
        assert_eq!(snapshot.group("staff").unwrap().inheritances, vec!["vip".to_string()]);
        assert_eq!(snapshot.user(&member_key).unwrap().groups, vec!["staff".to_string()]);
        assert!(snapshot.remove_group("base").is_none());
    }

    #[test]
    fn users_resolve_by_either_key_form() {
        let mut snapshot = Snapshot::new(IdentityMode::Uuid);
        let user = user_in("Steve", &[]);
        let id = user.id;
        snapshot.insert_user(user);

        assert!(snapshot.user(&UserKey::Id(id)).is_some());
        assert!(snapshot.user(&UserKey::from("steve")).is_some());
        assert!(snapshot.remove_user(&UserKey::from("STEVE")).is_some());
        assert_eq!(snapshot.user_count(), 0);
    }

    #[test]
    fn name_mode_indexes_by_lowercased_name() {
        let mut snapshot = Snapshot::new(IdentityMode::Name);
        let user = user_in("Steve", &[]);
        let id = user.id;
        snapshot.insert_user(user);

        assert!(snapshot.user(&UserKey::from("STEVE")).is_some());
        assert!(snapshot.user(&UserKey::Id(id)).is_some());
        snapshot.user_mut(&UserKey::Id(id)).unwrap().groups.push("vip".to_string());
        assert!(snapshot.user(&UserKey::from("steve")).unwrap().in_group("vip"));
    }

    #[test]
    fn readers_keep_their_snapshot_across_updates() {
        let registry = Registry::new(IdentityMode::Uuid);
        registry.update(|s| s.insert_group(Group::new("a")));

        let before = registry.snapshot();
        registry.update(|s| s.insert_group(Group::new("b")));

        assert_eq!(before.group_count(), 1);
        assert_eq!(registry.snapshot().group_count(), 2);
    }

    #[test]
    fn replace_swaps_the_whole_dataset() {
        let registry = Registry::new(IdentityMode::Uuid);
        registry.update(|s| s.insert_group(Group::new("old")));

        let mut next = Snapshot::new(IdentityMode::Uuid);
        next.insert_group(Group::new("new"));
        let previous = registry.replace(next);

        assert!(previous.group("old").is_some());
        let current = registry.snapshot();
        assert!(current.group("old").is_none());
        assert!(current.group("new").is_some());
    }
}
