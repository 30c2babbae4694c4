// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the log cursor.
//!
//! Errors are categorized by their source (event store, lease service,
//! handler dispatch) and by how the daemon should react to them.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------------|-------|-------------|
//! | `EventStore` | No | SQLite errors while reading the log or writing the position |
//! | `Lease` | No | Lease service unreachable or command failed |
//! | `LeaseLost` | No | Lease renewal failed mid-batch (another cursor may be active) |
//! | `UnknownEventType` | No | No handler registered for an event's type (version skew) |
//! | `Handler` | No | A registered handler failed to apply an event |
//! | `Config` | Yes | Configuration invalid |
//! | `InvalidState` | Yes | Daemon state machine violation (caller bug) |
//! | `Shutdown` | — | Cooperative cancellation, not a failure |
//! | `Internal` | Yes | Unexpected internal error |
//!
//! # Escalation Behavior
//!
//! Non-fatal errors feed the daemon's failure streak: the loop keeps
//! retrying until the streak has lasted longer than the configured maximum
//! error duration, at which point the daemon exits with
//! [`ExitReason::FatalError`](crate::daemon::ExitReason). Fatal errors
//! (per [`CursorError::is_fatal()`]) skip the streak and exit immediately.
//! `UnknownEventType` is deliberately non-fatal on first sight but is never
//! swallowed: silently dropping it would mean unreplicated data with no trace.

use thiserror::Error;

/// Result type alias for cursor operations.
pub type Result<T> = std::result::Result<T, CursorError>;

/// Errors that can occur while tailing and applying the event log.
#[derive(Error, Debug)]
pub enum CursorError {
    /// SQLite error while reading the event log or persisting the cursor
    /// position. Treated as transient (DB hiccups, lock contention) and
    /// retried by the poll loop within the failure window.
    #[error("Event store error: {0}")]
    EventStore(#[from] sqlx::Error),

    /// Lease service command failed.
    ///
    /// These are typically network errors talking to Redis and are
    /// retryable on the next iteration.
    #[error("Lease error ({operation}): {message}")]
    Lease {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Lease renewal failed while a batch was in flight.
    ///
    /// Another process may now hold the lease; the current batch is
    /// abandoned without advancing the position so it will be redelivered.
    #[error("Lease lost during batch processing")]
    LeaseLost,

    /// No handler is registered for an event's declared type.
    ///
    /// Usually version skew between the primary and this replica. Always
    /// logged with the correlation ID and re-raised into the escalation
    /// path, never dropped.
    #[error("Unknown event type {event_type:?} (event {event_id}, correlation {correlation_id})")]
    UnknownEventType {
        event_type: String,
        event_id: i64,
        correlation_id: String,
    },

    /// A registered handler failed to apply an event.
    ///
    /// The position is not advanced past the failed batch, so the event
    /// will be redelivered (handlers must be idempotent).
    #[error("Handler for {event_type:?} failed on event {event_id}: {message}")]
    Handler {
        event_type: String,
        event_id: i64,
        message: String,
    },

    /// Invalid or missing configuration.
    ///
    /// Not retryable. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon state machine violation.
    ///
    /// Indicates a bug in the caller, not a runtime condition.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Cooperative shutdown was requested mid-operation.
    ///
    /// Not a failure: the daemon unwinds without advancing past handled
    /// work and exits cleanly.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CursorError {
    /// Create a lease error from a redis error.
    pub fn lease(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Lease {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a lease error without a source.
    pub fn lease_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lease {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error should bypass the failure streak and terminate
    /// the daemon immediately.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::InvalidState { .. } => true,
            Self::Internal(_) => true,
            Self::EventStore(_) => false,
            Self::Lease { .. } => false,
            Self::LeaseLost => false,
            Self::UnknownEventType { .. } => false,
            Self::Handler { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Check if this error is tolerated by the rolling failure window.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_store_not_fatal() {
        let err = CursorError::EventStore(sqlx::Error::RowNotFound);
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lease_not_fatal() {
        let err = CursorError::lease_msg("try_obtain", "connection refused");
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("try_obtain"));
    }

    #[test]
    fn test_lease_lost_not_fatal() {
        let err = CursorError::LeaseLost;
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_event_type_not_fatal_but_retryable() {
        let err = CursorError::UnknownEventType {
            event_type: "repository_renamed".to_string(),
            event_id: 42,
            correlation_id: "abc-123".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("repository_renamed"));
        assert!(msg.contains("42"));
        assert!(msg.contains("abc-123"));
    }

    #[test]
    fn test_handler_failure_not_fatal() {
        let err = CursorError::Handler {
            event_type: "cache_invalidation".to_string(),
            event_id: 7,
            message: "backend unavailable".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_fatal() {
        let err = CursorError::Config("lease ttl must be positive".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_state_fatal() {
        let err = CursorError::InvalidState {
            expected: "Idle".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Idle"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_shutdown_neither_fatal_nor_retryable() {
        let err = CursorError::Shutdown;
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_fatal() {
        let err = CursorError::Internal("unexpected".to_string());
        assert!(err.is_fatal());
    }
}
