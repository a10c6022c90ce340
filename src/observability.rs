use std::net::SocketAddr;

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

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "bookd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "bookd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: appointments created.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "bookd_appointments_created_total";

/// Counter: create/reschedule attempts refused because every slot was taken.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "bookd_capacity_rejections_total";

/// Counter: applied status transitions. Labels: status.
pub const TRANSITIONS_TOTAL: &str = "bookd_transitions_total";

/// Counter: transitions applied by the lifecycle scan.
pub const AUTO_TRANSITIONS_TOTAL: &str = "bookd_auto_transitions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertSettings { .. } => "insert_settings",
        Command::SelectSettings => "select_settings",
        Command::InsertPolicy { .. } => "insert_policy",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectServices => "select_services",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSuggestions { .. } => "select_suggestions",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointmentsOn { .. } => "select_appointments",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertTransition { .. } => "insert_transition",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::SelectReputation { .. } => "select_reputation",
    }
}
