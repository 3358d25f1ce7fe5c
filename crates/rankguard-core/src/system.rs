//! Lifecycle of a permission system instance.
//!
//! `PermsSystem` is the explicitly constructed root object a host keeps for
//! as long as permissions are served. It owns the [`PermissionsManager`] and
//! the registration of the cleanup task.

use std::sync::Arc;

use parking_lot::Mutex;
use rankguard_types::config::PermsConfig;
use rankguard_types::error::PermsError;

use crate::checker::PermissionsChecker;
use crate::cleanup::CleanupTask;
use crate::manager::PermissionsManager;
use crate::notify::NetworkNotifier;
use crate::platform::{Platform, Scheduler, TaskId};
use crate::repository::BackendFactory;

pub struct PermsSystem {
    manager: Arc<PermissionsManager>,
    scheduler: Arc<dyn Scheduler>,
    cleanup_task: Mutex<Option<TaskId>>,
}

impl PermsSystem {
    /// Build a disabled system whose backend is created from
    /// `config.backend`.
    pub fn new(
        config: PermsConfig,
        backends: Arc<dyn BackendFactory>,
        notifier: Arc<dyn NetworkNotifier>,
        platform: Arc<dyn Platform>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, PermsError> {
        let backend = backends.create(config.backend)?;
        let manager = PermissionsManager::new(config, backend, backends, notifier, platform);
        Ok(Self {
            manager: Arc::new(manager),
            scheduler,
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> &Arc<PermissionsManager> {
        &self.manager
    }

    pub fn checker(&self) -> PermissionsChecker {
        PermissionsChecker::new(Arc::clone(&self.manager))
    }

    pub fn is_enabled(&self) -> bool {
        self.cleanup_task.lock().is_some()
    }

    /// Load the dataset and start the cleanup task. No-op when enabled.
    pub fn enable(&self) -> Result<(), PermsError> {
        let mut task = self.cleanup_task.lock();
        if task.is_some() {
            return Ok(());
        }

        self.manager.reload()?;
        let interval = self.manager.config().cleanup_interval();
        let id = self.scheduler.schedule_repeating(
            CleanupTask::new(&self.manager).into_task(),
            interval,
            interval,
        );
        *task = Some(id);

        tracing::info!(
            backend = %self.manager.backend_kind(),
            cleanup_interval_secs = interval.as_secs(),
            "permission system enabled"
        );
        Ok(())
    }

    /// Stop the cleanup task. No-op when disabled.
    pub fn disable(&self) {
        if let Some(id) = self.cleanup_task.lock().take() {
            self.scheduler.cancel(id);
            tracing::info!("permission system disabled");
        }
    }

    /// Restart the system with a fresh load, optionally telling every other
    /// instance to reload too.
    pub fn reload(&self, notify: bool) -> Result<(), PermsError> {
        self.disable();
        self.enable()?;
        if notify {
            self.manager.broadcast_all_changed();
        }
        Ok(())
    }
}

impl Drop for PermsSystem {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{ManualScheduler, MockPlatform, RecordedChange, RecordingNotifier, TestFactory, test_config};
    use rankguard_types::backend::BackendKind;
    use rankguard_types::group::Group;
    use rankguard_types::user::{IdentityMode, User, UserKey};
    use uuid::Uuid;

    struct Harness {
        system: PermsSystem,
        factory: Arc<TestFactory>,
        scheduler: Arc<ManualScheduler>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(TestFactory::new(IdentityMode::Uuid));
        let scheduler = Arc::new(ManualScheduler::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = test_config(IdentityMode::Uuid);
        config.cleanup_interval_secs = 60;
        let system = PermsSystem::new(
            config,
            factory.clone(),
            notifier.clone(),
            Arc::new(MockPlatform::default()),
            scheduler.clone(),
        )
        .unwrap();
        Harness {
            system,
            factory,
            scheduler,
            notifier,
        }
    }

    #[test]
    fn enable_loads_and_schedules_cleanup_once() {
        let h = harness();
        let backend = h.factory.created(BackendKind::Memory).unwrap();
        backend.insert_group(Group::new("vip"));

        assert!(!h.system.is_enabled());
        h.system.enable().unwrap();
        h.system.enable().unwrap();

        assert!(h.system.is_enabled());
        assert!(h.system.manager().get_group("vip").is_some());
        assert_eq!(
            h.scheduler.scheduled(),
            vec![(Duration::from_secs(60), Duration::from_secs(60))]
        );
    }

    #[test]
    fn scheduled_task_runs_cleanup() {
        let h = harness();
        h.system.enable().unwrap();
        h.system
            .manager()
            .add_user(User::new(Uuid::from_u128(1), "Idle"))
            .unwrap();

        h.scheduler.run_all();
        assert!(h.system.manager().users().is_empty());
        assert!(h.system.manager().get_user(&UserKey::Id(Uuid::from_u128(1))).is_some());
    }

    #[test]
    fn disable_cancels_cleanup() {
        let h = harness();
        h.system.enable().unwrap();
        h.system.disable();
        h.system.disable();

        assert!(!h.system.is_enabled());
        assert!(h.scheduler.scheduled().is_empty());
    }

    #[test]
    fn reload_can_notify_the_network() {
        let h = harness();
        h.system.enable().unwrap();
        h.system.reload(false).unwrap();
        assert!(h.notifier.changes().is_empty());

        h.system.reload(true).unwrap();
        assert_eq!(h.notifier.changes(), vec![RecordedChange::All]);
        assert_eq!(h.scheduler.scheduled().len(), 1);
    }

    #[test]
    fn drop_cancels_cleanup() {
        let h = harness();
        h.system.enable().unwrap();
        let scheduler = Arc::clone(&h.scheduler);
        drop(h);
        assert!(scheduler.scheduled().is_empty());
    }

    #[test]
    fn checker_shares_the_manager() {
        let h = harness();
        h.system.enable().unwrap();
        h.system.manager().add_user(User::new(Uuid::from_u128(1), "Steve")).unwrap();
        h.system
            .manager()
            .add_user_perm(&UserKey::from("steve"), &rankguard_types::scope::Scope::Global, "fly")
            .unwrap();
        assert!(h.system.checker().has_perm(&UserKey::from("steve"), "fly"));
    }
}
