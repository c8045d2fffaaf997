use std::sync::Arc;

use anyhow::Context;
use dispatcher::{
    CommandHandler, DispatchOutcome, DispatcherAppConfig, EventDispatcher, ScheduleRunner,
    parse_event_line,
};
use reliability::{DeadLetterStore, Deduplicator, ScheduleLockManager, spawn_sweeper};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = DispatcherAppConfig::load().context("Failed to load config")?;
    info!(
        handler = %config.handler.command,
        max_retries = config.retry.max_retries,
        schedules = config.schedules.len(),
        "Dispatcher starting"
    );

    let dedup = Arc::new(Deduplicator::with_default_ttl(config.dedup.ttl()));
    let dead_letters = Arc::new(DeadLetterStore::new());
    let locks = Arc::new(ScheduleLockManager::new());

    // Sweepers run until process exit.
    let _dedup_sweeper = spawn_sweeper(dedup.clone(), config.dedup.cleanup_interval());
    let _lock_sweeper = spawn_sweeper(locks.clone(), config.locks.cleanup_interval());

    let runner = Arc::new(ScheduleRunner::new(locks, config.locks.default_timeout()));
    let schedule_handles: Vec<_> = config
        .schedules
        .iter()
        .cloned()
        .map(|schedule| {
            let handler = CommandHandler::new(schedule.command.clone(), schedule.args.clone());
            runner.spawn(schedule, move || {
                let handler = handler.clone();
                async move { handler.run(&[], &[]).await.map(|_| ()) }
            })
        })
        .collect();

    let dispatcher = EventDispatcher::new(
        Arc::new(CommandHandler::from(&config.handler)),
        dedup,
        dead_letters.clone(),
    )
    .with_retry_config(config.retry.clone())
    .with_id_options(config.dedup.id_options());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut delivered = 0_usize;
    let mut duplicates = 0_usize;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let event = match parse_event_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                continue;
            }
        };

        match dispatcher.dispatch(event).await {
            DispatchOutcome::Delivered { .. } => delivered += 1,
            DispatchOutcome::Duplicate { .. } => duplicates += 1,
            DispatchOutcome::DeadLettered { .. } => {}
        }
    }

    let stats = dead_letters.stats();
    info!(
        delivered,
        duplicates,
        dead_lettered = stats.total,
        by_event = ?stats.by_event,
        "Input drained"
    );

    if !schedule_handles.is_empty() {
        info!("Schedules running, waiting for Ctrl-C");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        for handle in schedule_handles {
            handle.abort();
        }
        info!("Shutting down");
    }

    Ok(())
}
