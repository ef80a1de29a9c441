use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "meetbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "meetbook_query_duration_seconds";

// ── Connections ─────────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "meetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "meetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "meetbook_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "meetbook_auth_failures_total";

// ── Admission pipeline ──────────────────────────────────────────

/// Counter: submissions accepted onto the queue.
pub const SUBMISSIONS_TOTAL: &str = "meetbook_submissions_total";

/// Gauge: submissions waiting for a worker.
pub const QUEUE_DEPTH: &str = "meetbook_queue_depth";

/// Counter: settled submissions. Labels: outcome.
pub const ADMISSION_OUTCOMES_TOTAL: &str = "meetbook_admission_outcomes_total";

/// Histogram: one admission attempt, in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "meetbook_admission_duration_seconds";

/// Counter: transient failures sent back for another attempt.
pub const RETRIES_TOTAL: &str = "meetbook_retries_total";

/// Counter: submissions given up on after exhausting retries.
pub const DEAD_LETTERS_TOTAL: &str = "meetbook_dead_letters_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds. Labels: log.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "meetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush). Labels: log.
pub const WAL_FLUSH_BATCH_SIZE: &str = "meetbook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: log.
pub const COMPACTIONS_TOTAL: &str = "meetbook_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SubmitBooking { .. } => "submit_booking",
        Command::PreviewPrice { .. } => "preview_price",
        Command::SelectSubmission { .. } => "select_submission",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectHistory { .. } => "select_history",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::UpdateStatus { .. } => "update_status",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}
