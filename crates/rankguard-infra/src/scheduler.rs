//! Repeating task scheduler on a tokio runtime.
//!
//! Each task is a spawned loop over a `tokio::time::Interval` that stops when
//! its `CancellationToken` fires. Task bodies are blocking (they touch
//! storage), so every tick runs on the blocking pool and the next tick waits
//! for it to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rankguard_core::platform::{RepeatingTask, Scheduler, TaskId};
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct TokioScheduler {
    handle: Handle,
    tasks: DashMap<TaskId, CancellationToken>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    /// Schedule onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule onto the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, task: RepeatingTask, delay: Duration, interval: Duration) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.tasks.insert(id, token.clone());

        let period = interval.max(Duration::from_millis(1));
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let body = task.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || body()).await {
                    tracing::error!(task = id.0, error = %e, "repeating task panicked");
                }
            }
            tracing::debug!(task = id.0, "repeating task stopped");
        });

        tracing::debug!(task = id.0, ?delay, ?period, "scheduled repeating task");
        id
    }

    fn cancel(&self, id: TaskId) {
        if let Some((_, token)) = self.tasks.remove(&id) {
            token.cancel();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().cancel();
        }
        self.tasks.clear();
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("active_tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, RepeatingTask) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let task: RepeatingTask = Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, task)
    }

    #[tokio::test]
    async fn task_runs_repeatedly() {
        let scheduler = TokioScheduler::current();
        let (count, task) = counter();
        scheduler.schedule_repeating(task, Duration::ZERO, Duration::from_millis(5));

        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
        assert_eq!(scheduler.active_tasks(), 1);
    }

    #[tokio::test]
    async fn cancelled_task_stops_running() {
        let scheduler = TokioScheduler::current();
        let (count, task) = counter();
        let id = scheduler.schedule_repeating(task, Duration::ZERO, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.cancel(id);
        scheduler.cancel(id);
        assert_eq!(scheduler.active_tasks(), 0);

        // Let an in-flight tick finish before sampling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn delay_postpones_the_first_run() {
        let scheduler = TokioScheduler::current();
        let (count, task) = counter();
        scheduler.schedule_repeating(task, Duration::from_secs(60), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn system_cleanup_runs_on_the_scheduler() {
        use rankguard_core::PermsSystem;
        use rankguard_core::notify::NoopNotifier;
        use rankguard_core::platform::{Connection, Platform};
        use rankguard_types::backend::BackendKind;
        use rankguard_types::config::PermsConfig;
        use rankguard_types::user::{IdentityMode, User, UserKey};
        use tempfile::tempdir;
        use uuid::Uuid;

        use crate::storage::StorageFactory;

        struct Offline;
        impl Platform for Offline {
            fn connection(&self, _user: &UserKey) -> Option<Connection> {
                None
            }
        }

        let dir = tempdir().unwrap();
        let config = PermsConfig {
            backend: BackendKind::Json,
            cleanup_interval_secs: 1,
            ..PermsConfig::default()
        };
        let system = PermsSystem::new(
            config,
            Arc::new(StorageFactory::new(dir.path().to_path_buf(), IdentityMode::Uuid)),
            Arc::new(NoopNotifier),
            Arc::new(Offline),
            Arc::new(TokioScheduler::current()),
        )
        .unwrap();
        system.enable().unwrap();

        system.manager().add_user(User::new(Uuid::from_u128(1), "Idle")).unwrap();
        assert_eq!(system.manager().users().len(), 1);

        let manager = system.manager().clone();
        let mut evicted = false;
        for _ in 0..60 {
            if manager.users().is_empty() {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(evicted);
        system.disable();
    }

    #[tokio::test]
    async fn drop_cancels_everything() {
        let (count, task) = counter();
        {
            let scheduler = TokioScheduler::current();
            scheduler.schedule_repeating(task, Duration::ZERO, Duration::from_millis(5));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_drop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }
}
