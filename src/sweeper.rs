use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::notify;

/// Cadence of the per-tenant background jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            compact_threshold: 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub no_shows: usize,
    pub reminders: usize,
}

/// One pass of time-driven status maintenance at the engine's current time.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let now = engine.now();
    let mut report = SweepReport::default();

    match engine.mark_no_shows(now, engine.settings.no_show_grace_ms).await {
        Ok(ids) => report.no_shows = ids.len(),
        Err(e) => warn!(error = %e, "no-show sweep aborted"),
    }

    for appt in engine.due_reminders(now, engine.settings.reminder_lead_ms).await {
        match engine.mark_reminder_sent(appt.id).await {
            Ok(()) => report.reminders += 1,
            // Cancelled or rescheduled between the scan and the lock.
            Err(e) => debug!(appointment = %appt.id, error = %e, "reminder skipped"),
        }
    }
    report
}

/// Background task that marks no-shows and flags due reminders.
pub async fn run_status_updater(engine: Arc<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = sweep_once(&engine).await;
        if report != SweepReport::default() {
            info!(no_shows = report.no_shows, reminders = report.reminders, "status sweep");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!(appends, error = %e, "WAL compaction failed");
        }
    }
}

/// Forward every committed event to the outbound log sink as JSON.
pub async fn run_dispatcher(engine: Arc<Engine>) {
    let mut rx = engine.notify.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(event) => {
                debug!(target: "medslot::dispatch", doctor = %event.doctor_id(), kind = event.kind(), payload = %notify::payload(&event));
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "dispatcher lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
