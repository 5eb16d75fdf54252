use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Gauge: registered authors.
pub const AUTHORS_ACTIVE: &str = "bookd_authors_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: committed appointment transactions. Labels: action.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "bookd_bookings_committed_total";

/// Counter: transactions that lost an overlap re-check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "bookd_booking_conflicts_total";

/// Counter: cancel/reschedule refused by the policy window. Labels: action.
pub const POLICY_REJECTIONS_TOTAL: &str = "bookd_policy_rejections_total";

/// Counter: notices delivered. Labels: kind.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "bookd_notifications_sent_total";

/// Counter: notices that failed to deliver. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "bookd_notifications_failed_total";

/// Counter: appointments picked up by the reminder sweep.
pub const REMINDERS_SENT_TOTAL: &str = "bookd_reminders_sent_total";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
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
        Command::InsertAuthor(_) => "insert_author",
        Command::InsertInterviewType(_) => "insert_interview_type",
        Command::InsertRule { .. } => "insert_rule",
        Command::SetRuleActive { .. } => "set_rule_active",
        Command::InsertOverride(_) => "insert_override",
        Command::SelectRules { .. } => "select_rules",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots(_) => "select_slots",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::Reschedule { .. } => "reschedule",
        Command::Cancel { .. } => "cancel",
        Command::Confirm { .. } => "confirm",
        Command::AdminEdit { .. } => "admin_edit",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAudit { .. } => "select_audit",
        Command::RunReminders { .. } => "run_reminders",
    }
}
