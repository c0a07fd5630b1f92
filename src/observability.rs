use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lotledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lotledger_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lotledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lotledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lotledger_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "lotledger_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lotledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lotledger_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "lotledger_wal_compactions_total";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: reservations opened.
pub const RESERVATIONS_OPENED_TOTAL: &str = "lotledger_reservations_opened_total";

/// Counter: reservations closed. Labels: outcome (completed, forced, cancelled).
pub const RESERVATIONS_CLOSED_TOTAL: &str = "lotledger_reservations_closed_total";

/// Counter: refused reserve attempts. Labels: reason.
pub const RESERVE_REJECTED_TOTAL: &str = "lotledger_reserve_rejected_total";

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
        Command::InsertLot { .. } => "insert_lot",
        Command::UpdateLot { .. } => "update_lot",
        Command::DeleteLot { .. } => "delete_lot",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::InsertReservation { .. } => "reserve",
        Command::OccupyReservation { .. } => "occupy",
        Command::ReleaseReservation { .. } => "release",
        Command::ForceReleaseReservation { .. } => "force_release",
        Command::CancelReservation { .. } => "cancel",
        Command::SelectLots { .. } => "select_lots",
        Command::SelectSpots { .. } => "select_spots",
        Command::SelectUsers => "select_users",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectEstimate { .. } => "select_estimate",
    }
}

/// Low-cardinality label for a refused reserve.
pub fn reject_reason(e: &EngineError) -> &'static str {
    match e {
        EngineError::NoAvailableSpot(_) => "no_available_spot",
        EngineError::UserHasActiveReservation { .. } => "user_has_active_reservation",
        EngineError::LotNotFound(_) | EngineError::LotInactive(_) => "lot_unavailable",
        EngineError::UserNotFound(_) | EngineError::UserInactive(_) => "user_unavailable",
        other => other.class().as_str(),
    }
}
