use std::net::SocketAddr;

// ── Booking validation ──────────────────────────────────────────

/// Counter: candidate bookings rejected by the overlap check.
pub const CONFLICTS_TOTAL: &str = "resv_conflicts_total";

/// Counter: bookings retracted because the post-commit recheck found a conflict.
pub const RETRACTIONS_TOTAL: &str = "resv_post_commit_retractions_total";

/// Counter: rejected updates whose old slot was taken meanwhile; the booking
/// is left in `RequiresHandling`.
pub const RESTORE_CONFLICTS_TOTAL: &str = "resv_restore_conflicts_total";

/// Counter: booking changes committed. Labels: op (`reserve`, `adjust_time`, `state`, `access_type`, `kind`).
pub const BOOKINGS_COMMITTED_TOTAL: &str = "resv_bookings_committed_total";

// ── Derived indexes ─────────────────────────────────────────────

/// Histogram: AffectedSet index rebuild duration in seconds.
pub const AFFECTED_SET_REBUILD_DURATION_SECONDS: &str = "resv_affected_set_rebuild_duration_seconds";

/// Counter: AffectedSet rebuilds aborted on malformed structure.
pub const AFFECTED_SET_REBUILD_FAILURES_TOTAL: &str = "resv_affected_set_rebuild_failures_total";

/// Counter: staleness warnings logged.
pub const STALENESS_WARNINGS_TOTAL: &str = "resv_staleness_warnings_total";

/// Gauge: rows in the affecting-time-span index after the last rebuild or prune.
pub const SPAN_ROWS: &str = "resv_affecting_time_span_rows";

// ── Access codes ────────────────────────────────────────────────

/// Counter: provider calls. Labels: op, outcome.
pub const PROVIDER_CALLS_TOTAL: &str = "resv_provider_calls_total";

/// Histogram: provider call latency in seconds. Labels: op.
pub const PROVIDER_CALL_DURATION_SECONDS: &str = "resv_provider_call_duration_seconds";

/// Counter: drift detected by the sweep. Labels: outcome (`corrected`, `failed`).
pub const DRIFT_TOTAL: &str = "resv_access_code_drift_total";

/// Histogram: reconciliation sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "resv_sweep_duration_seconds";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "resv_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "resv_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
