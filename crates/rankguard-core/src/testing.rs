//! In-crate fakes for the backend, notifier, platform and scheduler ports.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rankguard_types::backend::BackendKind;
use rankguard_types::config::PermsConfig;
use rankguard_types::error::BackendError;
use rankguard_types::group::{Group, group_key};
use rankguard_types::scope::PermissionContext;
use rankguard_types::user::{IdentityMode, User, UserKey};
use uuid::Uuid;

use crate::manager::PermissionsManager;
use crate::notify::NetworkNotifier;
use crate::platform::{Connection, Platform, RepeatingTask, Scheduler, TaskId};
use crate::repository::{Backend, BackendFactory};

// ---------------------------------------------------------------------------
// TestBackend
// ---------------------------------------------------------------------------

type LoadHook = Box<dyn FnOnce() + Send>;

/// Map-backed backend with switchable read and write failures.
pub(crate) struct TestBackend {
    kind: BackendKind,
    mode: IdentityMode,
    groups: Mutex<BTreeMap<String, Group>>,
    users: Mutex<BTreeMap<String, User>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
    on_load: Mutex<Option<LoadHook>>,
}

impl TestBackend {
    pub(crate) fn new(kind: BackendKind, mode: IdentityMode) -> Self {
        Self {
            kind,
            mode,
            groups: Mutex::new(BTreeMap::new()),
            users: Mutex::new(BTreeMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            on_load: Mutex::new(None),
        }
    }

    /// Run `hook` once, inside the next group load, after the groups were
    /// read and before they are returned.
    pub(crate) fn on_next_load(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_load.lock() = Some(Box::new(hook));
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Write calls received so far, failed ones included.
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn group(&self, name: &str) -> Option<Group> {
        self.groups.lock().get(&group_key(name)).cloned()
    }

    pub(crate) fn user(&self, key: &UserKey) -> Option<User> {
        self.users.lock().values().find(|u| u.matches(key)).cloned()
    }

    /// Store a group directly, bypassing write accounting.
    pub(crate) fn insert_group(&self, group: Group) {
        self.groups.lock().insert(group.key(), group);
    }

    pub(crate) fn insert_user(&self, user: User) {
        self.users.lock().insert(user.key(self.mode).storage_key(), user);
    }

    pub(crate) fn remove_group(&self, name: &str) {
        self.groups.lock().remove(&group_key(name));
    }

    fn read(&self) -> Result<(), BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn write(&self) -> Result<(), BackendError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Io("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Backend for TestBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn load_groups(&self) -> Result<Vec<Group>, BackendError> {
        self.read()?;
        let groups = self.groups.lock().values().cloned().collect();
        let hook = self.on_load.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(groups)
    }

    fn load_users(&self) -> Result<Vec<User>, BackendError> {
        self.read()?;
        Ok(self.users.lock().values().cloned().collect())
    }

    fn load_group(&self, name: &str) -> Result<Option<Group>, BackendError> {
        self.read()?;
        Ok(self.group(name))
    }

    fn load_user(&self, key: &UserKey) -> Result<Option<User>, BackendError> {
        self.read()?;
        Ok(self.user(key))
    }

    fn save_group(&self, group: &Group) -> Result<(), BackendError> {
        self.write()?;
        self.insert_group(group.clone());
        Ok(())
    }

    fn save_user(&self, user: &User, _is_new: bool) -> Result<(), BackendError> {
        self.write()?;
        self.insert_user(user.clone());
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<(), BackendError> {
        self.write()?;
        self.remove_group(name);
        Ok(())
    }

    fn delete_user(&self, user: &User) -> Result<(), BackendError> {
        self.write()?;
        self.users.lock().remove(&user.key(self.mode).storage_key());
        Ok(())
    }

    fn clear_database(&self) -> Result<(), BackendError> {
        self.write()?;
        self.groups.lock().clear();
        self.users.lock().clear();
        Ok(())
    }
}

/// Creates [`TestBackend`]s and remembers them for inspection.
pub(crate) struct TestFactory {
    mode: IdentityMode,
    created: Mutex<Vec<Arc<TestBackend>>>,
    failing: Mutex<HashSet<BackendKind>>,
}

impl TestFactory {
    pub(crate) fn new(mode: IdentityMode) -> Self {
        Self {
            mode,
            created: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Backends of `kind` created from now on reject every write.
    pub(crate) fn fail_writes_for(&self, kind: BackendKind) {
        self.failing.lock().insert(kind);
    }

    /// The most recently created backend of `kind`.
    pub(crate) fn created(&self, kind: BackendKind) -> Option<Arc<TestBackend>> {
        self.created.lock().iter().rev().find(|b| b.kind == kind).cloned()
    }
}

impl BackendFactory for TestFactory {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = Arc::new(TestBackend::new(kind, self.mode));
        backend.fail_writes(self.failing.lock().contains(&kind));
        self.created.lock().push(Arc::clone(&backend));
        Ok(backend)
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecordedChange {
    User(String),
    Group(String),
    UserDeleted(String),
    GroupDeleted(String),
    AllUsers,
    AllGroups,
    All,
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    changes: Mutex<Vec<RecordedChange>>,
}

impl RecordingNotifier {
    pub(crate) fn changes(&self) -> Vec<RecordedChange> {
        self.changes.lock().clone()
    }

    fn record(&self, change: RecordedChange) {
        self.changes.lock().push(change);
    }
}

impl NetworkNotifier for RecordingNotifier {
    fn user_changed(&self, user: &User, _origin: &str) {
        self.record(RecordedChange::User(user.name.clone()));
    }

    fn group_changed(&self, group: &Group, _origin: &str) {
        self.record(RecordedChange::Group(group.name.clone()));
    }

    fn user_deleted(&self, user: &User, _origin: &str) {
        self.record(RecordedChange::UserDeleted(user.name.clone()));
    }

    fn group_deleted(&self, group: &Group, _origin: &str) {
        self.record(RecordedChange::GroupDeleted(group.name.clone()));
    }

    fn all_users_changed(&self, _origin: &str) {
        self.record(RecordedChange::AllUsers);
    }

    fn all_groups_changed(&self, _origin: &str) {
        self.record(RecordedChange::AllGroups);
    }

    fn all_changed(&self, _origin: &str) {
        self.record(RecordedChange::All);
    }
}

// ---------------------------------------------------------------------------
// MockPlatform / ManualScheduler
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockPlatform {
    connections: Mutex<Vec<Connection>>,
}

impl MockPlatform {
    pub(crate) fn connect(&self, id: Uuid, name: &str, context: PermissionContext) {
        self.connections.lock().push(Connection {
            id,
            name: name.to_string(),
            context,
        });
    }

    pub(crate) fn disconnect(&self, id: Uuid) {
        self.connections.lock().retain(|c| c.id != id);
    }
}

impl Platform for MockPlatform {
    fn connection(&self, user: &UserKey) -> Option<Connection> {
        self.connections
            .lock()
            .iter()
            .find(|c| match user {
                UserKey::Id(id) => &c.id == id,
                UserKey::Name(name) => c.name.to_lowercase() == name.to_lowercase(),
            })
            .cloned()
    }
}

/// Scheduler whose tasks only run when the test says so.
#[derive(Default)]
pub(crate) struct ManualScheduler {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<u64, (RepeatingTask, Duration, Duration)>>,
}

impl ManualScheduler {
    /// Run every scheduled task once.
    pub(crate) fn run_all(&self) {
        let tasks: Vec<RepeatingTask> = self
            .tasks
            .lock()
            .values()
            .map(|(task, _, _)| Arc::clone(task))
            .collect();
        for task in tasks {
            task();
        }
    }

    /// `(delay, interval)` of every scheduled task.
    pub(crate) fn scheduled(&self) -> Vec<(Duration, Duration)> {
        self.tasks
            .lock()
            .values()
            .map(|(_, delay, interval)| (*delay, *interval))
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, task: RepeatingTask, delay: Duration, interval: Duration) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().insert(id, (task, delay, interval));
        TaskId(id)
    }

    fn cancel(&self, id: TaskId) {
        self.tasks.lock().remove(&id.0);
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A manager wired to fakes, with handles to every fake.
pub(crate) struct Fixture {
    pub(crate) manager: Arc<PermissionsManager>,
    pub(crate) backend: Arc<TestBackend>,
    pub(crate) factory: Arc<TestFactory>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) platform: Arc<MockPlatform>,
}

pub(crate) fn test_config(mode: IdentityMode) -> PermsConfig {
    PermsConfig {
        identity_mode: mode,
        backend: BackendKind::Memory,
        origin: "local".to_string(),
        persist_retries: 1,
        persist_retry_delay_ms: 1,
        ..PermsConfig::default()
    }
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_mode(IdentityMode::Uuid)
    }

    pub(crate) fn with_mode(mode: IdentityMode) -> Self {
        let backend = Arc::new(TestBackend::new(BackendKind::Memory, mode));
        let factory = Arc::new(TestFactory::new(mode));
        let notifier = Arc::new(RecordingNotifier::default());
        let platform = Arc::new(MockPlatform::default());
        let manager = Arc::new(PermissionsManager::new(
            test_config(mode),
            backend.clone(),
            factory.clone(),
            notifier.clone(),
            platform.clone(),
        ));
        Self {
            manager,
            backend,
            factory,
            notifier,
            platform,
        }
    }
}
