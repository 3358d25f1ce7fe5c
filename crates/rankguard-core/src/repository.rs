//! Storage contract (port).
//!
//! These traits define the persistence interface that the infrastructure
//! layer (rankguard-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! All methods are blocking. Backends are only touched by administrative
//! mutations, reloads and cache misses, never by a permission check that
//! hits the registry.

use std::sync::Arc;

use rankguard_types::backend::BackendKind;
use rankguard_types::error::BackendError;
use rankguard_types::group::Group;
use rankguard_types::user::{User, UserKey};

/// Everything a backend holds.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub groups: Vec<Group>,
    pub users: Vec<User>,
}

/// Repository trait for group and user persistence.
///
/// Implementations live in rankguard-infra (e.g. `YamlBackend`). A backend
/// keys users by the identity mode it was constructed with.
pub trait Backend: Send + Sync {
    /// The storage technology behind this backend.
    fn kind(&self) -> BackendKind;

    /// Bulk load of the complete dataset.
    fn load(&self) -> Result<Dataset, BackendError> {
        Ok(Dataset {
            groups: self.load_groups()?,
            users: self.load_users()?,
        })
    }

    /// Load every persisted group.
    fn load_groups(&self) -> Result<Vec<Group>, BackendError>;

    /// Load every persisted user.
    fn load_users(&self) -> Result<Vec<User>, BackendError>;

    /// Load one group by (case-insensitive) name.
    fn load_group(&self, name: &str) -> Result<Option<Group>, BackendError>;

    /// Load one user by either key form.
    fn load_user(&self, key: &UserKey) -> Result<Option<User>, BackendError>;

    /// Insert or replace a group.
    fn save_group(&self, group: &Group) -> Result<(), BackendError>;

    /// Insert or replace a user. `is_new` marks a first write.
    fn save_user(&self, user: &User, is_new: bool) -> Result<(), BackendError>;

    /// Remove a group. Removing an absent group is not an error.
    fn delete_group(&self, name: &str) -> Result<(), BackendError>;

    /// Remove a user. Removing an absent user is not an error.
    fn delete_user(&self, user: &User) -> Result<(), BackendError>;

    /// Remove everything.
    fn clear_database(&self) -> Result<(), BackendError>;

    /// Replace the complete content with `dataset`.
    ///
    /// Used as a migration target. The default clears and saves entity by
    /// entity; file backends override it to stage the new content and swap
    /// it in only once every write succeeded, so a target sharing storage
    /// with the active backend is never left half written.
    fn replace_all(&self, dataset: &Dataset) -> Result<(), BackendError> {
        self.clear_database()?;
        for group in &dataset.groups {
            self.save_group(group)?;
        }
        for user in &dataset.users {
            self.save_user(user, true)?;
        }
        Ok(())
    }
}

/// Constructs backends by kind, used when migrating between technologies.
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError>;
}
