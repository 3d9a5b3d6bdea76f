use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: SQL commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shopbook_queries_total";

/// Histogram: SQL command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shopbook_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, conflict, rejected, failed).
pub const BOOKINGS_TOTAL: &str = "shopbook_bookings_total";

/// Counter: reschedule attempts. Labels: outcome.
pub const RESCHEDULES_TOTAL: &str = "shopbook_reschedules_total";

/// Counter: status transitions applied. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "shopbook_status_changes_total";

/// Counter: confirmation codes drawn again after a collision.
pub const CODE_COLLISIONS_TOTAL: &str = "shopbook_code_collisions_total";

/// Counter: notifications. Labels: kind, outcome (queued, dropped, sent, failed).
pub const NOTIFICATIONS_TOTAL: &str = "shopbook_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shopbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shopbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shopbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shopbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shopbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::InsertService { .. } => "insert_service",
        Command::DeactivateService { .. } => "deactivate_service",
        Command::SelectServices => "select_services",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::Reschedule { .. } => "reschedule",
        Command::SetStatus { .. } => "set_status",
        Command::CancelByCustomer { .. } => "cancel_by_customer",
        Command::SelectAppointments(_) => "select_appointments",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
