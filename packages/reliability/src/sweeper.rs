use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::dedup::Deduplicator;
use crate::schedule_lock::ScheduleLockManager;

/// A store whose expired entries can be swept in bulk.
pub trait Sweep: Send + Sync + 'static {
    /// Label used in log lines.
    fn name(&self) -> &'static str;

    /// Remove every expired entry. Returns how many were removed.
    fn sweep_expired(&self) -> usize;
}

impl Sweep for Deduplicator {
    fn name(&self) -> &'static str {
        "processed_events"
    }

    fn sweep_expired(&self) -> usize {
        self.cleanup_expired()
    }
}

impl Sweep for ScheduleLockManager {
    fn name(&self) -> &'static str {
        "schedule_locks"
    }

    fn sweep_expired(&self) -> usize {
        self.cleanup_expired_locks()
    }
}

/// Spawn a background task that periodically sweeps expired entries from `store`.
///
/// Runs until the returned handle is aborted or the runtime shuts down.
pub fn spawn_sweeper<S: Sweep>(store: Arc<S>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = store.sweep_expired();
            if removed > 0 {
                info!(store = store.name(), removed, "Swept expired entries");
            }
        }
    })
}
