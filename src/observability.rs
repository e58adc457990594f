use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "courtbook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "courtbook_http_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings written. Labels: kind (single, series).
pub const BOOKINGS_CREATED_TOTAL: &str = "courtbook_bookings_created_total";

/// Counter: requests rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "courtbook_booking_conflicts_total";

/// Counter: bookings hard-deleted.
pub const BOOKINGS_DELETED_TOTAL: &str = "courtbook_bookings_deleted_total";

/// Counter: waitlist entries surfaced as promotion candidates.
pub const WAITLIST_MATCHES_TOTAL: &str = "courtbook_waitlist_matches_total";

/// Counter: players added to open matches.
pub const OPEN_MATCH_JOINS_TOTAL: &str = "courtbook_open_match_joins_total";

/// Counter: audit records that could not be persisted.
pub const AUDIT_FAILURES_TOTAL: &str = "courtbook_audit_failures_total";

/// Counter: outbound chat messages. Labels: outcome.
pub const MESSAGES_SENT_TOTAL: &str = "courtbook_messages_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open server-sent event streams.
pub const EVENT_STREAMS_ACTIVE: &str = "courtbook_event_streams_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
