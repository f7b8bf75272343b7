//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Connection and reconnection outcomes
//! - Decoding throughput
//! - Queue depth and consumer polling
//! - Acks and checkpoint persistence
//! - Server and protocol errors
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_client_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits; installing a recorder/exporter is up to the
//! embedding application.
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_client::metrics;
//! use std::time::Duration;
//!
//! metrics::record_batch_decoded("db:3306", 12);
//! metrics::record_command_latency("db:3306", "COM_QUERY", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a connection attempt outcome.
pub fn record_connection(endpoint: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_client_connections_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

/// Record a reconnect attempt (0-indexed).
pub fn record_reconnect_attempt(endpoint: &str, attempt: u32) {
    counter!("replication_client_reconnect_attempts_total", "endpoint" => endpoint.to_string()).increment(1);
    gauge!("replication_client_reconnect_attempt", "endpoint" => endpoint.to_string()).set(attempt as f64);
}

/// Record the supervisor giving up.
pub fn record_given_up(endpoint: &str) {
    counter!("replication_client_given_up_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a decoded batch.
pub fn record_batch_decoded(endpoint: &str, events: usize) {
    counter!("replication_client_batches_decoded_total", "endpoint" => endpoint.to_string()).increment(1);
    counter!("replication_client_events_decoded_total", "endpoint" => endpoint.to_string()).increment(events as u64);
    histogram!("replication_client_batch_size", "endpoint" => endpoint.to_string()).record(events as f64);
}

/// Record current queue depth.
pub fn set_queue_depth(endpoint: &str, depth: usize) {
    gauge!("replication_client_queue_depth", "endpoint" => endpoint.to_string()).set(depth as f64);
}

/// Record batches thrown away when a queue is torn down.
pub fn record_queue_discarded(endpoint: &str, count: usize) {
    counter!("replication_client_queue_discarded_total", "endpoint" => endpoint.to_string()).increment(count as u64);
}

/// Record how long a `poll()` waited and whether it produced a batch.
pub fn record_poll_wait(duration: Duration, got_batch: bool) {
    let outcome = if got_batch { "batch" } else { "timeout" };
    histogram!("replication_client_poll_wait_seconds", "outcome" => outcome).record(duration.as_secs_f64());
}

/// Record an ack sent to the source.
pub fn record_ack(endpoint: &str) {
    counter!("replication_client_acks_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Record checkpoint flush batch (debounced writes).
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("replication_client_checkpoint_flushes_total").increment(1);
    counter!("replication_client_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_client_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("replication_client_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a protocol-level failure (malformed frame, cache miss, ...).
pub fn record_protocol_error(endpoint: &str, kind: &str) {
    counter!(
        "replication_client_protocol_errors_total",
        "endpoint" => endpoint.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an error reported by the server.
pub fn record_server_error(endpoint: &str, code: &str) {
    counter!(
        "replication_client_server_errors_total",
        "endpoint" => endpoint.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record correlated command round-trip latency.
pub fn record_command_latency(endpoint: &str, command: &str, duration: Duration) {
    histogram!(
        "replication_client_command_duration_seconds",
        "endpoint" => endpoint.to_string(),
        "command" => command.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a sink rejection in the dispatch loop.
pub fn record_sink_failure(endpoint: &str) {
    counter!("replication_client_sink_failures_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Set client state (as numeric gauge for alerting).
pub fn set_client_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Streaming" => 1.0,
        "Reconnecting" => 2.0,
        "GivenUp" => 3.0,
        "Closed" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_client_state").set(value);
}
