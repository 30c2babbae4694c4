//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Events fetched and applied
//! - Cursor delay (replication lag per event)
//! - Gap detection, fill, and loss
//! - Lease contention
//! - Failure streaks and daemon state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cursor_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions
//!
//! `cursor_delay_seconds` is the key operational signal: the age of each
//! event at the moment it is applied. A growing delay means the replica is
//! falling behind the primary.

use metrics::{counter, gauge, histogram};

/// Record the daemon's current state as a labeled gauge.
pub fn set_daemon_state(state: &str) {
    gauge!("cursor_daemon_state", "state" => state.to_string()).set(1.0);
}

/// Record a lease acquisition attempt.
pub fn record_lease_attempt(acquired: bool) {
    let status = if acquired { "acquired" } else { "contended" };
    counter!("cursor_lease_attempts_total", "status" => status).increment(1);
}

/// Record a batch of events fetched from the log.
pub fn record_batch_fetched(count: usize) {
    counter!("cursor_events_fetched_total").increment(count as u64);
    histogram!("cursor_batch_size").record(count as f64);
}

/// Record an event applied by a handler.
pub fn record_event_applied(event_type: &str) {
    counter!("cursor_events_applied_total", "event_type" => event_type.to_string()).increment(1);
}

/// Record an event skipped (payload-less row or replay-disabled type).
pub fn record_event_skipped(event_type: &str, reason: &'static str) {
    counter!("cursor_events_skipped_total", "event_type" => event_type.to_string(), "reason" => reason)
        .increment(1);
}

/// Record the cursor delay for one event: now minus the event's created_at.
pub fn record_cursor_delay(event_type: &str, delay_seconds: f64) {
    histogram!("cursor_delay_seconds", "event_type" => event_type.to_string())
        .record(delay_seconds);
}

/// Record the durably persisted cursor position.
pub fn set_cursor_position(id: i64) {
    gauge!("cursor_last_processed_event_id").set(id as f64);
}

/// Record newly detected gaps.
pub fn record_gaps_detected(count: u64) {
    counter!("cursor_gaps_detected_total").increment(count);
}

/// Record a gap whose event eventually arrived and was dispatched.
pub fn record_gap_filled() {
    counter!("cursor_gaps_filled_total").increment(1);
}

/// Record gaps abandoned without their events ever arriving (data loss).
pub fn record_gaps_lost(count: u64) {
    counter!("cursor_gaps_lost_total").increment(count);
}

/// Record the current number of tracked gaps.
pub fn set_tracked_gaps(count: usize) {
    gauge!("cursor_tracked_gaps").set(count as f64);
}

/// Record a loop iteration failure by error kind.
pub fn record_failure(kind: &'static str) {
    counter!("cursor_failures_total", "kind" => kind).increment(1);
}

/// Record event store retries (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("cursor_store_retries_total", "operation" => operation.to_string()).increment(1);
}
