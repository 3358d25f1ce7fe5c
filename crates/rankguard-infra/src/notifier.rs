//! In-process change broadcast between rankguard instances.
//!
//! `BroadcastNotifier` turns the manager's outgoing notifications into
//! [`NetworkEvent`]s on a `tokio::sync::broadcast` channel. A transport (or
//! a second manager in the same process) subscribes and feeds the events to
//! [`spawn_remote_listener`], which applies them to its own manager.

use std::sync::Arc;

use rankguard_core::PermissionsManager;
use rankguard_core::notify::NetworkNotifier;
use rankguard_types::event::{Change, NetworkEvent};
use rankguard_types::group::Group;
use rankguard_types::user::{IdentityMode, User};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Publishes change notifications as [`NetworkEvent`]s.
///
/// Cloning the notifier clones the sender, so every clone feeds the same
/// subscribers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<NetworkEvent>,
    mode: IdentityMode,
}

impl BroadcastNotifier {
    /// `mode` decides which key form identifies users in outgoing events.
    pub fn new(capacity: usize, mode: IdentityMode) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, mode }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    /// Send to all current subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: NetworkEvent) {
        let _ = self.sender.send(event);
    }

    fn emit(&self, origin: &str, change: Change) {
        tracing::trace!(origin, change = ?change, "publishing change");
        self.publish(NetworkEvent::new(origin, change));
    }
}

impl std::fmt::Debug for BroadcastNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastNotifier")
            .field("mode", &self.mode)
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl NetworkNotifier for BroadcastNotifier {
    fn user_changed(&self, user: &User, origin: &str) {
        self.emit(origin, Change::UserChanged { user: user.key(self.mode) });
    }

    fn group_changed(&self, group: &Group, origin: &str) {
        self.emit(origin, Change::GroupChanged { group: group.name.clone() });
    }

    fn user_deleted(&self, user: &User, origin: &str) {
        self.emit(origin, Change::UserDeleted { user: user.key(self.mode) });
    }

    fn group_deleted(&self, group: &Group, origin: &str) {
        self.emit(origin, Change::GroupDeleted { group: group.name.clone() });
    }

    fn all_users_changed(&self, origin: &str) {
        self.emit(origin, Change::AllUsersChanged);
    }

    fn all_groups_changed(&self, origin: &str) {
        self.emit(origin, Change::AllGroupsChanged);
    }

    fn all_changed(&self, origin: &str) {
        self.emit(origin, Change::AllChanged);
    }
}

/// Apply every event from `rx` to `manager` until `cancel` fires or the
/// channel closes.
///
/// Manager calls may touch the backend, so each one runs on the blocking
/// pool. A lagged receiver has missed events and falls back to a full
/// reload.
pub fn spawn_remote_listener(
    manager: Arc<PermissionsManager>,
    mut rx: broadcast::Receiver<NetworkEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            let result = match received {
                Ok(event) => {
                    let manager = Arc::clone(&manager);
                    tokio::task::spawn_blocking(move || manager.apply_remote(&event).map(|_| ())).await
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "remote listener lagged, reloading everything");
                    let manager = Arc::clone(&manager);
                    tokio::task::spawn_blocking(move || manager.reload()).await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to apply remote change"),
                Err(e) => tracing::error!(error = %e, "remote change task panicked"),
            }
        }
        tracing::debug!("remote listener stopped");
    })
}
