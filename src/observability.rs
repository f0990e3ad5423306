use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "medslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "medslot_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (committed, rejected, conflicted, transient, error).
pub const RESERVATIONS_TOTAL: &str = "medslot_reservations_total";

/// Histogram: end-to-end reservation latency in seconds, lock wait included.
pub const RESERVATION_DURATION_SECONDS: &str = "medslot_reservation_duration_seconds";

/// Counter: doctor lock acquisitions that hit the commit timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "medslot_lock_timeouts_total";

// ── Background jobs ─────────────────────────────────────────────

pub const NO_SHOWS_MARKED_TOTAL: &str = "medslot_no_shows_marked_total";
pub const REMINDERS_SENT_TOTAL: &str = "medslot_reminders_sent_total";

/// Counter: events published to the notification hub. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "medslot_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "medslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "medslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "medslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medslot_wal_flush_batch_size";

/// Install the tracing subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("medslot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::UpdateDoctor { .. } => "update_doctor",
        Command::SetWeeklyHours { .. } => "set_weekly_hours",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::InsertStatusChange { .. } => "insert_status_change",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SelectDoctors { .. } => "select_doctors",
        Command::SelectWeeklyHours { .. } => "select_weekly_hours",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
    }
}
