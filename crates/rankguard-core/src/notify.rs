//! Network notifier contract.
//!
//! After every local mutation the manager tells the notifier what changed so
//! that other instances can refresh. Delivery is fire-and-forget: nothing
//! here returns a result and the manager never waits for acknowledgement.

use rankguard_types::group::Group;
use rankguard_types::user::User;

/// Outgoing change notifications, each tagged with the sender's origin token.
pub trait NetworkNotifier: Send + Sync {
    fn user_changed(&self, user: &User, origin: &str);

    fn group_changed(&self, group: &Group, origin: &str);

    fn user_deleted(&self, user: &User, origin: &str);

    fn group_deleted(&self, group: &Group, origin: &str);

    fn all_users_changed(&self, origin: &str);

    fn all_groups_changed(&self, origin: &str);

    fn all_changed(&self, origin: &str);
}

/// Notifier for single-instance deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NetworkNotifier for NoopNotifier {
    fn user_changed(&self, _user: &User, _origin: &str) {}

    fn group_changed(&self, _group: &Group, _origin: &str) {}

    fn user_deleted(&self, _user: &User, _origin: &str) {}

    fn group_deleted(&self, _group: &Group, _origin: &str) {}

    fn all_users_changed(&self, _origin: &str) {}

    fn all_groups_changed(&self, _origin: &str) {}

    fn all_changed(&self, _origin: &str) {}
}
