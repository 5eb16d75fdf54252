use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// How often the compactor polls the WAL append counter.
const COMPACT_POLL: Duration = Duration::from_secs(30);

/// Background task that periodically sends due reminders.
/// Runs in-process, so the job secret does not apply.
pub async fn run_reminder_sweeper(engine: Arc<Engine>, period: Duration) {
    if period.is_zero() {
        info!("reminder sweeper disabled");
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let due = engine.dispatch_due_reminders().await;
        tracing::debug!(due = due.len(), "reminder sweep finished");
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        info!("WAL compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(COMPACT_POLL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
