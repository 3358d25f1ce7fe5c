//! Permission checks for connected identities.

use std::sync::Arc;

use rankguard_types::scope::PermissionContext;
use rankguard_types::user::UserKey;

use crate::manager::PermissionsManager;

/// Convenience facade over [`PermissionsManager::evaluate`].
#[derive(Clone)]
pub struct PermissionsChecker {
    manager: Arc<PermissionsManager>,
}

impl PermissionsChecker {
    pub fn new(manager: Arc<PermissionsManager>) -> Self {
        Self { manager }
    }

    /// Global entries only.
    pub fn has_perm(&self, user: &UserKey, permission: &str) -> bool {
        self.manager
            .evaluate(user, permission, &PermissionContext::global())
    }

    pub fn has_perm_on_server(&self, user: &UserKey, permission: &str, server: &str) -> bool {
        self.manager
            .evaluate(user, permission, &PermissionContext::server(server))
    }

    pub fn has_perm_on_server_in_world(
        &self,
        user: &UserKey,
        permission: &str,
        server: &str,
        world: &str,
    ) -> bool {
        self.manager
            .evaluate(user, permission, &PermissionContext::world(server, world))
    }

    /// Check in the server and world the identity is connected to.
    ///
    /// Identities that are not connected are checked globally.
    pub fn has_perm_in_current_context(&self, user: &UserKey, permission: &str) -> bool {
        let context = self
            .manager
            .platform()
            .connection(user)
            .map(|c| c.context)
            .unwrap_or_default();
        self.manager.evaluate(user, permission, &context)
    }
}
