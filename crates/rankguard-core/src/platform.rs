//! Host platform contract.
//!
//! The host (proxy, game server, test harness) tells the core which
//! identities are connected and where they are, and runs repeating tasks on
//! its own scheduler.

use std::sync::Arc;
use std::time::Duration;

use rankguard_types::scope::PermissionContext;
use rankguard_types::user::UserKey;
use uuid::Uuid;

/// A connected identity and its current location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub context: PermissionContext,
}

/// Resolves connected identities.
pub trait Platform: Send + Sync {
    /// The connection for `user`, if the identity is currently connected.
    fn connection(&self, user: &UserKey) -> Option<Connection>;

    fn is_connected(&self, user: &UserKey) -> bool {
        self.connection(user).is_some()
    }
}

/// Handle of a scheduled repeating task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Body of a repeating task. Runs on a thread where blocking is allowed.
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync>;

/// Runs repeating background tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`, then every `interval`, until cancelled.
    fn schedule_repeating(&self, task: RepeatingTask, delay: Duration, interval: Duration) -> TaskId;

    /// Stop a task. Cancelling an unknown or finished task is a no-op.
    fn cancel(&self, id: TaskId);
}
