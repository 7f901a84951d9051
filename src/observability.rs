use std::net::SocketAddr;

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "timetabler_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "timetabler_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: allocation writes rejected by an exclusivity rule. Labels: dimension.
pub const CONFLICTS_TOTAL: &str = "timetabler_conflicts_total";

/// Counter: slot writes rejected for overlapping another slot of the shift.
pub const SLOT_OVERLAPS_TOTAL: &str = "timetabler_slot_overlaps_total";

/// Counter: per-item bulk outcomes. Labels: op, outcome.
pub const BULK_ITEMS_TOTAL: &str = "timetabler_bulk_items_total";

// ── Resources ───────────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "timetabler_connections_active";
pub const CONNECTIONS_TOTAL: &str = "timetabler_connections_total";
/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "timetabler_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "timetabler_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "timetabler_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "timetabler_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDay { .. } => "insert_day",
        Command::SetDayActive { .. } => "set_day_active",
        Command::InsertShift { .. } => "insert_shift",
        Command::InsertReference { .. } => "insert_reference",
        Command::InsertTimeTable { .. } => "insert_timetable",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::BulkApply { .. } => "bulk_apply",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::BulkRemove { .. } => "bulk_remove",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectWorkload { .. } => "select_workload",
    }
}
