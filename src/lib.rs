//! # log-cursor
//!
//! A single-writer cursor over a replicated, append-only event log.
//!
//! A primary node appends events describing changes; each secondary site
//! runs this daemon to tail the log, dispatch events to idempotent
//! handlers, and durably track how far it has processed. Delivery is
//! at-least-once: the position only advances after a batch is fully
//! handled, so crashes redeliver rather than lose.
//!
//! ```text
//!                    ┌─────────────────────────────────────────┐
//!                    │                 Daemon                  │
//!                    │                                         │
//!   lease store ◀────┤ lease election        poll loop         │
//!   (Redis)          │      │                    │             │
//!                    │      ▼                    ▼             │
//!                    │ LeaseService      EventStore (SQLite)   │
//!                    │                    │ event_log          │
//!                    │                    │ cursor_position    │
//!                    │                    ▼                    │
//!                    │ GapTracker ◀── batch ──▶ HandlerRegistry│
//!                    │ (in-memory)              (EventHandler) │
//!                    └─────────────────────────────────────────┘
//! ```
//!
//! Key properties:
//!
//! - **Single active cursor**: an exclusive TTL lease (Redis in
//!   production, in-memory for tests) ensures only one process tails the
//!   log per deployment, while extra standby processes wait for failover.
//! - **Gap handling**: event IDs can have holes (rolled-back producer
//!   transactions, commit-visibility skew). Missing IDs are tracked in
//!   memory, re-queried after an age threshold, and dropped with a
//!   data-loss warning past a hard ceiling.
//! - **Bounded failure tolerance**: transient errors are retried while the
//!   consecutive-failure streak is younger than a configured window; after
//!   that [`Daemon::run`] returns [`ExitReason::FatalError`] for a
//!   supervisor to act on.
//!
//! Embed the library with real [`EventHandler`]s, or run the standalone
//! binary with log-only handlers to observe a deployment.

pub mod config;
pub mod daemon;
pub mod error;
pub mod event_log;
pub mod gap_tracking;
pub mod handler;
pub mod lease;
pub mod metrics;

pub use config::{CursorConfig, NodeRole};
pub use daemon::{CursorState, Daemon, ExitReason, RunOutcome};
pub use error::{CursorError, Result};
pub use event_log::{BatchControl, BatchSink, EventLogEntry, EventStore};
pub use gap_tracking::GapTracker;
pub use handler::{Dispatch, EventHandler, HandlerError, HandlerRegistry, NoOpHandler};
pub use lease::{InMemoryLease, LeaseService, LeaseToken, RedisLease};
