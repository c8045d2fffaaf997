use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reliability::{LockOptions, ScheduleLockManager, ScheduleRun};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;

/// Fires recurring tasks under per-schedule locks so a slow run is never
/// overlapped by the next tick.
pub struct ScheduleRunner {
    locks: Arc<ScheduleLockManager>,
    default_timeout: Duration,
}

impl ScheduleRunner {
    pub fn new(locks: Arc<ScheduleLockManager>, default_timeout: Duration) -> Self {
        Self {
            locks,
            default_timeout,
        }
    }

    pub fn locks(&self) -> &ScheduleLockManager {
        &self.locks
    }

    /// Run `task` once if no other run of `schedule_id` holds the lock.
    pub async fn fire<F, Fut>(
        &self,
        schedule_id: &str,
        timeout: Option<Duration>,
        task: F,
    ) -> anyhow::Result<ScheduleRun<()>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let options = LockOptions::with_timeout(timeout.unwrap_or(self.default_timeout));
        let run = self.locks.with_schedule_lock(schedule_id, task, options).await;

        match &run {
            Ok(ScheduleRun::Executed(())) => info!(schedule_id, "Scheduled run finished"),
            Ok(ScheduleRun::Skipped { locked_until }) => warn!(
                schedule_id,
                locked_until = %locked_until,
                "Previous run still holds the lock, skipping"
            ),
            Err(e) => error!(schedule_id, error = %e, "Scheduled run failed"),
        }
        run
    }

    /// Fire `task` every `schedule.interval()`, starting immediately.
    ///
    /// Each firing runs on its own task so a long run does not delay the
    /// ticker; overlapping firings are skipped by the lock. Aborting the
    /// returned handle stops new firings but not one already in flight.
    pub fn spawn<T, Fut>(self: &Arc<Self>, schedule: ScheduleConfig, task: T) -> JoinHandle<()>
    where
        T: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runner = Arc::clone(self);
        let task = Arc::new(task);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(schedule.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                schedule_id = %schedule.id,
                interval_secs = schedule.interval().as_secs(),
                "Schedule registered"
            );

            loop {
                ticker.tick().await;
                let runner = Arc::clone(&runner);
                let task = Arc::clone(&task);
                let schedule_id = schedule.id.clone();
                let timeout = schedule.timeout();
                tokio::spawn(async move {
                    // Errors are logged inside fire.
                    let _ = runner.fire(&schedule_id, timeout, || task()).await;
                });
            }
        })
    }
}
