use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "branchledger_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "branchledger_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "branchledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "branchledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "branchledger_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "branchledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "branchledger_wal_flush_batch_size";

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: reservations entering a status. Labels: status.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "branchledger_reservation_transitions_total";

/// Counter: refused reservation operations. Labels: reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "branchledger_reservation_rejections_total";

/// Counter: ledger invariant breaches found by a mutation or an audit.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "branchledger_invariant_violations_total";

/// Counter: low-stock notices emitted.
pub const LOW_STOCK_NOTICES_TOTAL: &str = "branchledger_low_stock_notices_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProduct { .. } => "insert_product",
        Command::DeactivateProduct { .. } => "deactivate_product",
        Command::InsertBranch { .. } => "insert_branch",
        Command::DeactivateBranch { .. } => "deactivate_branch",
        Command::SetStock { .. } => "set_stock",
        Command::SetStockBulk { .. } => "set_stock_bulk",
        Command::SetThreshold { .. } => "set_threshold",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ReservationAction { .. } => "reservation_action",
        Command::UpdateReservationQuantity { .. } => "update_reservation_quantity",
        Command::InsertTransfer { .. } => "insert_transfer",
        Command::TransferTransition { .. } => "transfer_action",
        Command::InsertRestock { .. } => "insert_restock",
        Command::RestockTransition { .. } => "restock_action",
        Command::InsertScheduleChange { .. } => "insert_schedule_change",
        Command::ReviewScheduleChange { .. } => "review_schedule_change",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBranchStock { .. } => "select_branch_stock",
        Command::SelectBranchSummary { .. } => "select_branch_summary",
        Command::SelectLowStock { .. } => "select_low_stock",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectApprovedTotal { .. } => "select_approved_total",
        Command::SelectScheduleChanges { .. } => "select_schedule_changes",
        Command::SelectStaffSchedule { .. } => "select_staff_schedule",
        Command::SelectTransfer { .. } => "select_transfer",
        Command::SelectTransfers { .. } => "select_transfers",
        Command::SelectRestock { .. } => "select_restock",
        Command::SelectRestocks { .. } => "select_restocks",
    }
}
