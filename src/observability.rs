use std::net::SocketAddr;

// ── Booking path ────────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_TOTAL: &str = "slotkeeper_reservations_total";

/// Counter: rejected operations. Labels: op, reason (`EngineError::kind`).
pub const REJECTIONS_TOTAL: &str = "slotkeeper_rejections_total";

/// Counter: optimistic writes that found a newer version and restarted. Labels: op.
pub const OCC_RETRIES_TOTAL: &str = "slotkeeper_occ_retries_total";

/// Counter: booking status changes. Labels: to, origin.
pub const TRANSITIONS_TOTAL: &str = "slotkeeper_transitions_total";

/// Histogram: reserve latency in seconds, including retries.
pub const RESERVE_DURATION_SECONDS: &str = "slotkeeper_reserve_duration_seconds";

/// Counter: notices handed to the hub. Labels: kind.
pub const NOTICES_TOTAL: &str = "slotkeeper_notices_total";

// ── Admission ───────────────────────────────────────────────────

/// Counter: requests denied by the rate limiter. Labels: class.
pub const RATE_LIMITED_TOTAL: &str = "slotkeeper_rate_limited_total";

// ── Reconciler ──────────────────────────────────────────────────

/// Histogram: sweep duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "slotkeeper_sweep_duration_seconds";

/// Counter: records a sweep changed. Labels: sweep.
pub const SWEEP_CHANGED_TOTAL: &str = "slotkeeper_sweep_changed_total";

/// Counter: per-record sweep failures. Labels: sweep.
pub const SWEEP_FAILURES_TOTAL: &str = "slotkeeper_sweep_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

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
