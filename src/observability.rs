use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: operation, outcome.
pub const OPERATIONS_TOTAL: &str = "parkline_operations_total";

/// Histogram: operation latency in seconds, lock waits included. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "parkline_operation_duration_seconds";

// ── Contention & domain counters ────────────────────────────────

/// Counter: lock acquisitions abandoned after the configured bound.
pub const LOCK_TIMEOUTS_TOTAL: &str = "parkline_lock_timeouts_total";

/// Counter: generated tickets that were already taken.
pub const TICKET_COLLISIONS_TOTAL: &str = "parkline_ticket_collisions_total";

/// Counter: subscription entries spent on bookings.
pub const SUBSCRIPTION_ENTRIES_TOTAL: &str = "parkline_subscription_entries_total";

/// Counter: completed bookings priced. Labels: applied (subscription, rule, fallback).
pub const PRICED_TOTAL: &str = "parkline_priced_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkline_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkline_wal_compactions_total";

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

/// Outcome label for an operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// Count and time one engine operation.
pub fn record<T>(operation: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}
