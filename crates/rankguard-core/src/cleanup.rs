//! Periodic eviction of idle cached users.

use std::sync::{Arc, Weak};

use crate::manager::PermissionsManager;
use crate::platform::RepeatingTask;

/// Background job calling [`PermissionsManager::cleanup`].
///
/// Holds a weak handle so a scheduled task never keeps the manager alive;
/// once the manager is dropped the task does nothing.
#[derive(Clone)]
pub struct CleanupTask {
    manager: Weak<PermissionsManager>,
}

impl CleanupTask {
    pub fn new(manager: &Arc<PermissionsManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }

    /// Run one cleanup pass. Returns the number of evicted users.
    pub fn run(&self) -> usize {
        match self.manager.upgrade() {
            Some(manager) => manager.cleanup(),
            None => 0,
        }
    }

    pub fn into_task(self) -> RepeatingTask {
        Arc::new(move || {
            self.run();
        })
    }
}
