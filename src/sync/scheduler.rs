//! Background Sync Scheduler
//!
//! Provides automatic periodic pushes at the configured interval, plus a
//! supervisor for ad-hoc sync tasks (auto-sync after local edits, startup
//! check) so they can be awaited before exit instead of being dropped.
//! Uses Tokio tasks for non-blocking background execution.

use super::manager::SyncManager;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Periodic Scheduler
// ============================================================================

/// Background scheduler for periodic push operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Periodic sync is disabled")]
    Disabled,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl Default for BackgroundScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start the periodic push loop using the manager's current settings
    pub async fn start(&self, manager: SyncManager) -> Result<(), SchedulerError> {
        let settings = manager.settings().await;
        if !settings.periodic_sync_enabled {
            return Err(SchedulerError::Disabled);
        }

        // Validate interval
        let interval_minutes = settings.periodic_sync_interval_minutes;
        if !(1..=1440).contains(&interval_minutes) {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be 1-1440 minutes, got {}",
                interval_minutes
            )));
        }

        self.start_with_period(manager, settings.periodic_interval())
    }

    /// Start the loop with an explicit period
    pub fn start_with_period(&self, manager: SyncManager, period: Duration) -> Result<(), SchedulerError> {
        // Check if already running
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = self.running.clone();
        let shutdown = self.shutdown.clone();

        // Spawn background task
        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, shutdown, manager, period).await;
        });

        *lock(&self.task_handle) = Some(handle);

        log::info!("Background scheduler started (interval: {:?})", period);
        Ok(())
    }

    /// Stop the scheduler between ticks.
    ///
    /// A push already in progress is allowed to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        self.shutdown.notify_one();

        let handle = lock(&self.task_handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Scheduler task ended abnormally: {}", e);
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        manager: SyncManager,
        period: Duration,
    ) {
        // First tick one period from now; startup has its own check
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.notified() => {
                    log::info!("Scheduler loop: shutdown requested");
                    break;
                }
            }

            // Check if we should stop
            if !running.load(Ordering::SeqCst) {
                break;
            }

            log::debug!("Periodic push triggered by scheduler");

            match manager.periodic_push().await {
                Ok(report) => {
                    log::info!(
                        "Periodic push completed: pushed={}, skipped={}, queued={}, errors={}",
                        report.pushed().len(),
                        report.skipped().len(),
                        report.queued().len(),
                        report.errors.len()
                    );
                }
                Err(e) => {
                    log::warn!("Periodic push failed: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// Task Supervisor
// ============================================================================

/// Tracks ad-hoc sync tasks so shutdown can wait for them
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tasks: Arc<StdMutex<JoinSet<()>>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);

        // Reap finished tasks so the set does not grow without bound
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                log::error!("Supervised task failed: {}", e);
            }
        }

        tasks.spawn(async move {
            task.await;
            log::debug!("Task {} finished", name);
        });
    }

    /// Number of tasks not yet reaped
    pub fn in_flight(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Wait for every tracked task, including ones spawned while waiting
    pub async fn wait_all(&self) {
        loop {
            let mut batch = std::mem::take(&mut *lock(&self.tasks));
            if batch.is_empty() {
                break;
            }

            log::info!("Waiting for {} in-flight sync tasks", batch.len());
            while let Some(result) = batch.join_next().await {
                if let Err(e) = result {
                    log::error!("Supervised task failed: {}", e);
                }
            }
        }
    }
}
