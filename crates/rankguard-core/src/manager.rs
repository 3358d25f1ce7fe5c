//! Permission manager: the public mutation and query facade.
//!
//! Every mutation follows the same three steps:
//! 1. Apply the change to the [`Registry`] under its short write lock
//! 2. Persist the affected entity through the active [`Backend`]
//! 3. Tell the [`NetworkNotifier`] what changed, tagged with the local origin
//!
//! Backend writes are retried with a constant backoff. A write that still
//! fails is logged and the in-memory change is kept; callers are not told.
//! Reads never touch the backend unless a user is missing from the cache.
//!
//! Mutations hold the mutation gate shared; reloads, `format` and backend
//! migration hold it exclusively from the backend read to the registry swap,
//! so a reload never overwrites a mutation with data read before it.
//! Lock order is gate, then active backend, then registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use backon::{BlockingRetryable, ConstantBuilder};
use parking_lot::RwLock;
use rankguard_types::backend::BackendKind;
use rankguard_types::config::PermsConfig;
use rankguard_types::error::{BackendError, PermsError};
use rankguard_types::event::{Change, NetworkEvent};
use rankguard_types::group::{Group, group_key};
use rankguard_types::scope::{DisplayField, PermissionContext, Scope, ScopedAttributes};
use rankguard_types::user::{User, UserKey};
use uuid::Uuid;

use crate::evaluator::{DisplayAttributes, PermissionEvaluator};
use crate::notify::NetworkNotifier;
use crate::platform::Platform;
use crate::registry::{Registry, Snapshot};
use crate::repository::{Backend, BackendFactory, Dataset};
use crate::resolver::{self, ValidationReport};

/// Orchestrates the registry, the backend and the network notifier.
///
/// Constructed explicitly and shared behind an `Arc`; there is no global
/// instance.
pub struct PermissionsManager {
    config: PermsConfig,
    registry: Registry,
    backend: RwLock<Arc<dyn Backend>>,
    backends: Arc<dyn BackendFactory>,
    notifier: Arc<dyn NetworkNotifier>,
    platform: Arc<dyn Platform>,
    evaluator: PermissionEvaluator,
    gate: RwLock<()>,
}

impl PermissionsManager {
    /// Create a manager with an empty registry. Call [`reload`](Self::reload)
    /// to populate it.
    pub fn new(
        config: PermsConfig,
        backend: Arc<dyn Backend>,
        backends: Arc<dyn BackendFactory>,
        notifier: Arc<dyn NetworkNotifier>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            registry: Registry::new(config.identity_mode),
            evaluator: PermissionEvaluator::with_regex(config.use_regex_perms),
            backend: RwLock::new(backend),
            backends,
            notifier,
            platform,
            config,
            gate: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &PermsConfig {
        &self.config
    }

    /// Token attached to every outgoing notification.
    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.read().kind()
    }

    /// The current registry snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.snapshot()
    }

    fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend.read())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Run a backend write with bounded retries; log and swallow the final
    /// failure.
    fn persist(
        &self,
        action: &'static str,
        subject: &str,
        op: impl Fn(&dyn Backend) -> Result<(), BackendError>,
    ) {
        let backend = self.backend();
        let policy = ConstantBuilder::default()
            .with_delay(self.config.persist_retry_delay())
            .with_max_times(self.config.persist_retries);

        let result = (|| op(backend.as_ref()))
            .retry(policy)
            .sleep(std::thread::sleep)
            .notify(|err: &BackendError, after: Duration| {
                tracing::debug!(action, subject, error = %err, retry_in = ?after, "retrying backend write");
            })
            .call();

        if let Err(err) = result {
            tracing::warn!(action, subject, error = %err, "backend write failed, keeping in-memory state");
        }
    }

    fn commit_group(&self, action: &'static str, group: &Group) {
        tracing::debug!(group = %group.name, action, "group updated");
        self.persist(action, &group.name, |b| b.save_group(group));
        self.notifier.group_changed(group, self.origin());
    }

    fn commit_user(&self, action: &'static str, user: &User, is_new: bool) {
        tracing::debug!(user = %user.name, action, "user updated");
        self.persist(action, &user.name, |b| b.save_user(user, is_new));
        self.notifier.user_changed(user, self.origin());
    }

    // -----------------------------------------------------------------------
    // Group mutations
    // -----------------------------------------------------------------------

    /// Apply `f` to a group; persist and notify only if it reports a change.
    fn mutate_group(
        &self,
        name: &str,
        action: &'static str,
        f: impl FnOnce(&mut Group) -> bool,
    ) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let updated = self.registry.update(|s| {
            let group = s
                .group_mut(name)
                .ok_or_else(|| PermsError::GroupNotFound(name.to_string()))?;
            let changed = f(group);
            group.scoped.prune();
            if !changed {
                return Ok(None);
            }
            Ok::<_, PermsError>(Some(group.clone()))
        })?;

        if let Some(group) = updated {
            self.commit_group(action, &group);
        }
        Ok(())
    }

    pub fn add_group_perm(&self, group: &str, scope: &Scope, perm: &str) -> Result<(), PermsError> {
        self.mutate_group(group, "add_group_perm", |g| g.scoped.at_mut(scope).add_perm(perm))
    }

    pub fn remove_group_perm(&self, group: &str, scope: &Scope, perm: &str) -> Result<(), PermsError> {
        self.mutate_group(group, "remove_group_perm", |g| {
            g.scoped.at_mut(scope).remove_perm(perm)
        })
    }

    /// Make `group` inherit from `parent`.
    ///
    /// An edge that would close a cycle is refused with a warning and
    /// leaves the group unchanged.
    pub fn add_group_inheritance(&self, group: &str, parent: &str) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let updated = self.registry.update(|s| {
            let parent_name = s
                .group(parent)
                .map(|p| p.name.clone())
                .ok_or_else(|| PermsError::GroupNotFound(parent.to_string()))?;
            if resolver::would_create_cycle(s, group, parent) {
                tracing::warn!(group, parent, "inheritance would create a cycle, ignoring");
                return Ok(None);
            }
            let Some(target) = s.group_mut(group) else {
                return Err(PermsError::GroupNotFound(group.to_string()));
            };
            if target.inherits(&parent_name) {
                return Ok(None);
            }
            target.inheritances.push(parent_name);
            Ok(Some(target.clone()))
        })?;

        if let Some(group) = updated {
            self.commit_group("add_group_inheritance", &group);
        }
        Ok(())
    }

    pub fn remove_group_inheritance(&self, group: &str, parent: &str) -> Result<(), PermsError> {
        let parent = group_key(parent);
        self.mutate_group(group, "remove_group_inheritance", |g| {
            let before = g.inheritances.len();
            g.inheritances.retain(|i| group_key(i) != parent);
            g.inheritances.len() != before
        })
    }

    pub fn set_group_ladder(&self, group: &str, ladder: &str) -> Result<(), PermsError> {
        let ladder = ladder.trim();
        self.mutate_group(group, "set_group_ladder", |g| {
            if g.ladder == ladder {
                return false;
            }
            g.ladder = ladder.to_string();
            true
        })
    }

    pub fn set_group_rank(&self, group: &str, rank: i32) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_rank", |g| {
            std::mem::replace(&mut g.rank, rank) != rank
        })
    }

    pub fn set_group_weight(&self, group: &str, weight: i32) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_weight", |g| {
            std::mem::replace(&mut g.weight, weight) != weight
        })
    }

    pub fn set_group_default(&self, group: &str, is_default: bool) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_default", |g| {
            std::mem::replace(&mut g.is_default, is_default) != is_default
        })
    }

    pub fn set_group_display(&self, group: &str, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_display", |g| {
            set_field(&mut g.scoped, scope, DisplayField::Display, value)
        })
    }

    pub fn set_group_prefix(&self, group: &str, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_prefix", |g| {
            set_field(&mut g.scoped, scope, DisplayField::Prefix, value)
        })
    }

    pub fn set_group_suffix(&self, group: &str, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_group(group, "set_group_suffix", |g| {
            set_field(&mut g.scoped, scope, DisplayField::Suffix, value)
        })
    }

    /// Register a new group.
    ///
    /// Inheritances that do not resolve or would close a cycle are dropped.
    pub fn add_group(&self, group: Group) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let group = self.registry.update(|s| {
            if s.contains_group(&group.name) {
                return Err(PermsError::GroupExists(group.name.clone()));
            }
            let mut group = group;
            for parent in resolver::validate_group(s, &mut group) {
                tracing::warn!(group = %group.name, parent = %parent, "dropped inheritance of new group");
            }
            s.insert_group(group.clone());
            Ok(group)
        })?;

        self.commit_group("add_group", &group);
        Ok(())
    }

    /// Delete a group and every reference to it.
    ///
    /// Groups that inherited from it and cached users that were members are
    /// re-saved. Deleting an unknown group is a no-op.
    pub fn delete_group(&self, name: &str) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let Some(removed) = self.registry.update(|s| s.remove_group(name)) else {
            return Ok(());
        };

        let snapshot = self.snapshot();
        for child in removed.inheriting_groups.iter().filter_map(|n| snapshot.group(n)) {
            self.persist("delete_group", &child.name, |b| b.save_group(child));
        }
        for member in removed.members.iter().filter_map(|k| snapshot.user(k)) {
            self.persist("delete_group", &member.name, |b| b.save_user(member, false));
        }
        self.persist("delete_group", &removed.group.name, |b| b.delete_group(&removed.group.name));

        tracing::debug!(
            group = %removed.group.name,
            inheriting = removed.inheriting_groups.len(),
            members = removed.members.len(),
            "group deleted"
        );
        self.notifier.group_deleted(&removed.group, self.origin());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User mutations
    // -----------------------------------------------------------------------

    fn mutate_user(
        &self,
        key: &UserKey,
        action: &'static str,
        f: impl FnOnce(&mut User) -> bool,
    ) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let resident = self
            .get_user(key)
            .ok_or_else(|| PermsError::UserNotFound(key.to_string()))?;

        let updated = self.registry.update(|s| {
            // Cleanup may have evicted the user since the lookup.
            if !s.contains_user(key) {
                s.insert_user(resident);
            }
            let user = s
                .user_mut(key)
                .ok_or_else(|| PermsError::UserNotFound(key.to_string()))?;
            let changed = f(user);
            user.scoped.prune();
            if !changed {
                return Ok(None);
            }
            Ok::<_, PermsError>(Some(user.clone()))
        })?;

        if let Some(user) = updated {
            self.commit_user(action, &user, false);
        }
        Ok(())
    }

    pub fn add_user_perm(&self, user: &UserKey, scope: &Scope, perm: &str) -> Result<(), PermsError> {
        self.mutate_user(user, "add_user_perm", |u| u.scoped.at_mut(scope).add_perm(perm))
    }

    pub fn remove_user_perm(&self, user: &UserKey, scope: &Scope, perm: &str) -> Result<(), PermsError> {
        self.mutate_user(user, "remove_user_perm", |u| {
            u.scoped.at_mut(scope).remove_perm(perm)
        })
    }

    /// Add `group` to the user's memberships. The group must exist.
    pub fn add_user_group(&self, user: &UserKey, group: &str) -> Result<(), PermsError> {
        let name = self
            .snapshot()
            .group(group)
            .map(|g| g.name.clone())
            .ok_or_else(|| PermsError::GroupNotFound(group.to_string()))?;
        self.mutate_user(user, "add_user_group", |u| {
            if u.in_group(&name) {
                return false;
            }
            u.groups.push(name);
            true
        })
    }

    pub fn remove_user_group(&self, user: &UserKey, group: &str) -> Result<(), PermsError> {
        let key = group_key(group);
        self.mutate_user(user, "remove_user_group", |u| {
            let before = u.groups.len();
            u.groups.retain(|g| group_key(g) != key);
            u.groups.len() != before
        })
    }

    pub fn set_user_display(&self, user: &UserKey, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_user(user, "set_user_display", |u| {
            set_field(&mut u.scoped, scope, DisplayField::Display, value)
        })
    }

    pub fn set_user_prefix(&self, user: &UserKey, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_user(user, "set_user_prefix", |u| {
            set_field(&mut u.scoped, scope, DisplayField::Prefix, value)
        })
    }

    pub fn set_user_suffix(&self, user: &UserKey, value: Option<&str>, scope: &Scope) -> Result<(), PermsError> {
        self.mutate_user(user, "set_user_suffix", |u| {
            set_field(&mut u.scoped, scope, DisplayField::Suffix, value)
        })
    }

    /// Register a new user.
    ///
    /// A user without memberships joins every default group. Fails with
    /// `UserExists` if the identity is cached or persisted.
    pub fn add_user(&self, user: User) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let key = user.key(self.registry.mode());
        if self.snapshot().contains_user(&key) || self.backend().load_user(&key)?.is_some() {
            return Err(PermsError::UserExists(key.to_string()));
        }

        let user = self.registry.update(|s| {
            let mut user = user;
            user.is_temporary = false;
            if user.groups.is_empty() {
                user.groups = resolver::default_groups(s)
                    .into_iter()
                    .map(|g| g.name.clone())
                    .collect();
            }
            resolver::validate_user(s, &mut user);
            s.insert_user(user.clone());
            user
        });
        self.commit_user("add_user", &user, true);
        Ok(())
    }

    /// Delete a user from the cache and the backend. Unknown users are a
    /// no-op.
    pub fn delete_user(&self, key: &UserKey) -> Result<(), PermsError> {
        let _gate = self.gate.read_recursive();
        let user = match self.registry.update(|s| s.remove_user(key)) {
            Some(user) => user,
            None => match self.backend().load_user(key)? {
                Some(user) => user,
                None => return Ok(()),
            },
        };

        tracing::debug!(user = %user.name, "user deleted");
        self.persist("delete_user", &user.name, |b| b.delete_user(&user));
        self.notifier.user_deleted(&user, self.origin());
        Ok(())
    }

    /// Materialize a user seen for the first time.
    ///
    /// The user joins every default group and is persisted right away. If
    /// the identity is already cached, the cached user is returned instead.
    pub fn create_temp_user(&self, name: &str, id: Uuid) -> User {
        let _gate = self.gate.read_recursive();
        let (user, created) = self.registry.update(|s| {
            let mut user = User::new(id, name);
            if let Some(existing) = s.user(&user.key(s.mode())) {
                return (existing.clone(), false);
            }
            user.is_temporary = true;
            user.groups = resolver::default_groups(s)
                .into_iter()
                .map(|g| g.name.clone())
                .collect();
            s.insert_user(user.clone());
            (user, true)
        });

        if created {
            tracing::debug!(user = %user.name, groups = user.groups.len(), "created temporary user");
            self.persist("create_temp_user", &user.name, |b| b.save_user(&user, true));
        }
        user
    }

    /// Drop a user's in-memory entry. Persisted data is untouched.
    pub fn remove_user_from_cache(&self, key: &UserKey) -> bool {
        self.registry.update(|s| s.remove_user(key)).is_some()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_group(&self, name: &str) -> Option<Group> {
        self.snapshot().group(name).cloned()
    }

    /// All groups ordered by name.
    pub fn groups(&self) -> Vec<Group> {
        self.snapshot().groups().cloned().collect()
    }

    /// Look up a user, loading or materializing it on a cache miss.
    ///
    /// On a miss the backend is asked first. If it has no record and the
    /// identity is connected, a temporary user is created. A backend read
    /// failure returns `None` and never creates a user.
    pub fn get_user(&self, key: &UserKey) -> Option<User> {
        if let Some(user) = self.snapshot().user(key) {
            return Some(user.clone());
        }

        let _gate = self.gate.read_recursive();
        match self.backend().load_user(key) {
            Ok(Some(user)) => return Some(self.cache_loaded_user(key, user)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(user = %key, error = %err, "failed to load user");
                return None;
            }
        }

        let connection = self.platform.connection(key)?;
        Some(self.create_temp_user(&connection.name, connection.id))
    }

    fn cache_loaded_user(&self, key: &UserKey, user: User) -> User {
        self.registry.update(|s| {
            if let Some(existing) = s.user(key) {
                return existing.clone();
            }
            let mut user = user;
            user.is_temporary = false;
            for group in resolver::validate_user(s, &mut user) {
                tracing::debug!(user = %user.name, group = %group, "dropped unresolvable membership");
            }
            s.insert_user(user.clone());
            user
        })
    }

    /// Users currently in the cache.
    pub fn users(&self) -> Vec<User> {
        self.snapshot().users().cloned().collect()
    }

    /// Every user the backend knows, with cached state taking precedence.
    pub fn registered_users(&self) -> Result<Vec<User>, PermsError> {
        let backend = self.backend();
        Ok(self.merged_users(backend.as_ref())?)
    }

    /// Every registered user that is a direct member of `group`.
    pub fn group_users(&self, group: &str) -> Result<Vec<User>, PermsError> {
        Ok(self
            .registered_users()?
            .into_iter()
            .filter(|u| u.in_group(group))
            .collect())
    }

    fn merged_users(&self, backend: &dyn Backend) -> Result<Vec<User>, BackendError> {
        let snapshot = self.snapshot();
        let mode = snapshot.mode();
        let mut users: HashMap<String, User> = backend
            .load_users()?
            .into_iter()
            .map(|u| (u.key(mode).storage_key(), u))
            .collect();
        for user in snapshot.users() {
            users.insert(user.key(mode).storage_key(), user.clone());
        }

        let mut users: Vec<User> = users.into_values().collect();
        users.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(users)
    }

    pub fn next_group(&self, group: &str) -> Option<Group> {
        let snapshot = self.snapshot();
        let group = snapshot.group(group)?;
        resolver::next_group(&snapshot, group).cloned()
    }

    pub fn previous_group(&self, group: &str) -> Option<Group> {
        let snapshot = self.snapshot();
        let group = snapshot.group(group)?;
        resolver::previous_group(&snapshot, group).cloned()
    }

    pub fn ladder_groups(&self, ladder: &str) -> Vec<Group> {
        let snapshot = self.snapshot();
        resolver::ladder_groups(&snapshot, ladder)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn ladders(&self) -> Vec<String> {
        resolver::ladders(&self.snapshot())
    }

    pub fn default_groups(&self) -> Vec<Group> {
        let snapshot = self.snapshot();
        resolver::default_groups(&snapshot)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn main_group(&self, user: &UserKey) -> Option<Group> {
        let (snapshot, user) = self.resolve_user(user)?;
        resolver::main_group(&snapshot, &user).cloned()
    }

    pub fn inheritance_chain(&self, group: &str) -> Vec<Group> {
        let snapshot = self.snapshot();
        let Some(group) = snapshot.group(group) else {
            return Vec::new();
        };
        resolver::inheritance_chain(&snapshot, group)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Resolve `user` together with the snapshot its groups are read from.
    ///
    /// On a cache miss the user is loaded or materialized first and the
    /// snapshot is taken after that. A lazy load publishes a new snapshot,
    /// which clones the registry when another reader still holds the old one.
    fn resolve_user(&self, user: &UserKey) -> Option<(Arc<Snapshot>, User)> {
        let snapshot = self.snapshot();
        if let Some(cached) = snapshot.user(user) {
            let cached = cached.clone();
            return Some((snapshot, cached));
        }
        let loaded = self.get_user(user)?;
        Some((self.snapshot(), loaded))
    }

    /// Whether `user` holds `permission` in `context`. Unknown users hold
    /// nothing.
    pub fn evaluate(&self, user: &UserKey, permission: &str, context: &PermissionContext) -> bool {
        let Some((snapshot, user)) = self.resolve_user(user) else {
            return false;
        };
        self.evaluator.evaluate(&snapshot, &user, permission, context)
    }

    pub fn effective_permissions(&self, user: &UserKey, context: &PermissionContext) -> Vec<String> {
        let Some((snapshot, user)) = self.resolve_user(user) else {
            return Vec::new();
        };
        self.evaluator.effective_permissions(&snapshot, &user, context)
    }

    pub fn display_attributes(&self, user: &UserKey, context: &PermissionContext) -> DisplayAttributes {
        let Some((snapshot, user)) = self.resolve_user(user) else {
            return DisplayAttributes::default();
        };
        self.evaluator.display_attributes(&snapshot, &user, context)
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    /// Replace the registry with a fresh load from the backend.
    ///
    /// Users cached before the reload are taken from the new dataset; users
    /// the backend no longer knows leave the cache. On a read failure the
    /// registry is left untouched.
    pub fn reload(&self) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        let dataset = self.backend().load()?;
        let mode = self.registry.mode();
        let cached: HashSet<String> = self
            .snapshot()
            .users()
            .map(|u| u.key(mode).storage_key())
            .collect();

        let mut next = Snapshot::new(mode);
        for group in dataset.groups {
            next.insert_group(group);
        }
        for user in dataset.users {
            if cached.contains(&user.key(mode).storage_key()) {
                next.insert_user(user);
            }
        }
        let report = resolver::validate(&mut next);
        log_repairs(&report);

        let (groups, users) = (next.group_count(), next.user_count());
        self.registry.replace(next);
        tracing::info!(groups, users, backend = %self.backend_kind(), "permissions reloaded");
        Ok(())
    }

    /// Refresh one cached user from the backend. Users not in the cache are
    /// left alone.
    pub fn reload_user(&self, key: &UserKey) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        if !self.snapshot().contains_user(key) {
            return Ok(());
        }
        let loaded = self.backend().load_user(key)?;

        self.registry.update(|s| {
            s.remove_user(key);
            if let Some(mut user) = loaded {
                resolver::validate_user(s, &mut user);
                s.insert_user(user);
            }
        });
        tracing::debug!(user = %key, "user reloaded");
        Ok(())
    }

    /// Refresh one group from the backend, or remove it (with its
    /// references) if the backend no longer has it.
    pub fn reload_group(&self, name: &str) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        let loaded = self.backend().load_group(name)?;

        self.registry.update(|s| match loaded {
            Some(mut group) => {
                for parent in resolver::validate_group(s, &mut group) {
                    tracing::warn!(group = %group.name, parent = %parent, "dropped inheritance of reloaded group");
                }
                s.insert_group(group);
            }
            None => {
                s.remove_group(name);
            }
        });
        tracing::debug!(group = name, "group reloaded");
        Ok(())
    }

    /// Refresh every cached user from the backend.
    pub fn reload_users(&self) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        let mode = self.registry.mode();
        let mut loaded: HashMap<String, User> = self
            .backend()
            .load_users()?
            .into_iter()
            .map(|u| (u.key(mode).storage_key(), u))
            .collect();

        let count = self.registry.update(|s| {
            let cached: Vec<UserKey> = s.users().map(|u| u.key(mode)).collect();
            for key in &cached {
                s.remove_user(key);
                if let Some(mut user) = loaded.remove(&key.storage_key()) {
                    resolver::validate_user(s, &mut user);
                    s.insert_user(user);
                }
            }
            s.user_count()
        });
        tracing::debug!(users = count, "cached users reloaded");
        Ok(())
    }

    /// Replace every group with the backend's copy and re-validate.
    pub fn reload_groups(&self) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        let groups = self.backend().load_groups()?;

        let report = self.registry.update(|s| {
            s.clear_groups();
            for group in groups {
                s.insert_group(group);
            }
            resolver::validate(s)
        });
        log_repairs(&report);
        tracing::debug!(groups = self.snapshot().group_count(), "groups reloaded");
        Ok(())
    }

    /// Apply a change announced by another instance.
    ///
    /// Returns `false` for the local instance's own echoes.
    pub fn apply_remote(&self, event: &NetworkEvent) -> Result<bool, PermsError> {
        if event.is_from(self.origin()) {
            return Ok(false);
        }

        tracing::debug!(origin = %event.origin, change = ?event.change, "applying remote change");
        match &event.change {
            Change::UserChanged { user } => self.reload_user(user)?,
            Change::GroupChanged { group } => self.reload_group(group)?,
            Change::UserDeleted { user } => {
                self.remove_user_from_cache(user);
            }
            Change::GroupDeleted { group } => {
                let _gate = self.gate.read_recursive();
                self.registry.update(|s| s.remove_group(group));
            }
            Change::AllUsersChanged => self.reload_users()?,
            Change::AllGroupsChanged => self.reload_groups()?,
            Change::AllChanged => self.reload()?,
        }
        Ok(true)
    }

    /// Ask every other instance to reload everything.
    pub fn broadcast_all_changed(&self) {
        self.notifier.all_changed(self.origin());
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Copy the complete dataset into a new backend of `kind` and make it
    /// the active one.
    ///
    /// The active backend is locked for the whole copy so no write can land
    /// on the old backend after it was read. If any step fails the old
    /// backend stays active.
    pub fn migrate_backend(&self, kind: BackendKind) -> Result<(), PermsError> {
        let _gate = self.gate.write();
        let mut active = self.backend.write();
        let from = active.kind();
        let migration = |source: BackendError| PermsError::Migration { target: kind, source };

        let dataset = Dataset {
            groups: self.groups(),
            users: self.merged_users(active.as_ref()).map_err(migration)?,
        };
        let target = self.backends.create(kind).map_err(migration)?;
        target.replace_all(&dataset).map_err(migration)?;

        *active = target;
        drop(active);

        tracing::info!(
            from = %from,
            to = %kind,
            groups = dataset.groups.len(),
            users = dataset.users.len(),
            "backend migrated"
        );
        self.notifier.all_changed(self.origin());
        Ok(())
    }

    /// Evict cached users that are not connected and hold nothing.
    ///
    /// Returns how many users were evicted.
    pub fn cleanup(&self) -> usize {
        let snapshot = self.snapshot();
        let mode = snapshot.mode();
        let stale: Vec<UserKey> = snapshot
            .users()
            .filter(|u| !u.has_customization())
            .map(|u| u.key(mode))
            .filter(|key| !self.platform.is_connected(key))
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let evicted = self.registry.update(|s| {
            let mut evicted = 0;
            for key in &stale {
                // A mutation may have customized the user since the scan.
                if s.user(key).is_some_and(|u| !u.has_customization()) {
                    s.remove_user(key);
                    evicted += 1;
                }
            }
            evicted
        });
        tracing::debug!(evicted, "cache cleanup finished");
        evicted
    }

    /// Rewrite the backend from the validated dataset.
    ///
    /// Users without any customization are deleted from the backend; every
    /// other user and every group is saved again. Returns the number of
    /// deleted users.
    pub fn format(&self) -> Result<usize, PermsError> {
        let _gate = self.gate.write();
        let backend = self.backend();
        let snapshot = self.snapshot();
        let mut users = self.merged_users(backend.as_ref())?;

        let mut deleted = 0;
        for user in &mut users {
            if !user.has_customization() {
                backend.delete_user(user)?;
                deleted += 1;
                continue;
            }
            resolver::validate_user(&snapshot, user);
            user.scoped.prune();
            backend.save_user(user, false)?;
        }
        for group in snapshot.groups() {
            backend.save_group(group)?;
        }

        tracing::info!(groups = snapshot.group_count(), deleted, "backend formatted");
        self.notifier.all_changed(self.origin());
        Ok(deleted)
    }
}

fn set_field(
    scoped: &mut ScopedAttributes,
    scope: &Scope,
    field: DisplayField,
    value: Option<&str>,
) -> bool {
    let attributes = scoped.at_mut(scope);
    let before = attributes.get(field).map(str::to_string);
    attributes.set(field, value.map(str::to_string));
    attributes.get(field) != before.as_deref()
}

fn log_repairs(report: &ValidationReport) {
    for (group, parent) in &report.dropped_inheritances {
        tracing::warn!(group = %group, parent = %parent, "dropped unresolvable inheritance");
    }
    for (group, parent) in &report.broken_cycles {
        tracing::warn!(group = %group, parent = %parent, "dropped inheritance closing a cycle");
    }
    for (user, group) in &report.dropped_memberships {
        tracing::warn!(user = %user, group = %group, "dropped unresolvable membership");
    }
}
