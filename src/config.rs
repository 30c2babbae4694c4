//! Configuration for the log cursor daemon.
//!
//! All tunables live here. Configuration is passed to
//! [`Daemon::new()`](crate::daemon::Daemon::new) and can be constructed
//! programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use log_cursor::config::{CursorConfig, NodeRole};
//!
//! let mut config = CursorConfig::default();
//! config.node.node_id = "replica-ldn-1".into();
//! config.node.role = NodeRole::Secondary;
//! config.store.sqlite_path = "/var/lib/cursor/events.db".into();
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CursorConfig
//! ├── node: NodeConfig          # identity + role (secondary/primary/unconfigured)
//! ├── poll: PollConfig          # batch size, poll interval, standby backoff
//! ├── lease: LeaseConfig        # lease key, TTL, redis URL
//! ├── gaps: GapConfig           # gap age threshold, hard ceiling, map bound
//! ├── failure: FailureConfig    # max tolerated error-streak duration
//! └── store: StoreConfig        # SQLite path for log + cursor position
//! ```
//!
//! # Duration fields
//!
//! Durations are humantime strings (`"5s"`, `"1m"`, `"10m"`), parsed on
//! access with a documented fallback when malformed.
//!
//! # Open tunables
//!
//! The production values for `failure.max_error_duration` and the gap
//! thresholds are deployment decisions, not constants of the design. The
//! defaults below (10 minutes each) are placeholders; confirm against your
//! deployment documentation before relying on them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Daemon::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CursorConfig {
    /// Identity and role of the local node.
    #[serde(default)]
    pub node: NodeConfig,

    /// Poll loop tunables.
    #[serde(default)]
    pub poll: PollConfig,

    /// Exclusive lease (single-active-cursor election).
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Gap tracking thresholds.
    #[serde(default)]
    pub gaps: GapConfig,

    /// Failure-streak escalation window.
    #[serde(default)]
    pub failure: FailureConfig,

    /// Event log / cursor position persistence.
    #[serde(default)]
    pub store: StoreConfig,

    /// Event types the standalone binary should accept with a log-only
    /// handler. Irrelevant when the library is embedded with real handlers.
    #[serde(default)]
    pub log_only_event_types: Vec<String>,
}

impl CursorConfig {
    /// Create a minimal config for testing: in-memory store, tiny timeouts.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node: NodeConfig {
                node_id: node_id.to_string(),
                role: NodeRole::Secondary,
            },
            poll: PollConfig {
                interval: "10ms".to_string(),
                jitter_fraction: 0.0,
                standby_backoff: "50ms".to_string(),
                batch_size: 100,
            },
            lease: LeaseConfig {
                key: format!("test:cursor:{}", node_id),
                ttl: "5s".to_string(),
                redis_url: None,
            },
            gaps: GapConfig::default(),
            failure: FailureConfig {
                max_error_duration: "1s".to_string(),
            },
            store: StoreConfig::in_memory(),
            log_only_event_types: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: who we are
// ═══════════════════════════════════════════════════════════════════════════════

/// Role of the local node in the replication topology.
///
/// Only an active secondary tails the log. A primary (or a node not yet
/// configured into the topology) stands by: no lease attempts, no log reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Active replica: tails the log and applies events.
    Secondary,
    /// The log producer: never consumes its own log.
    Primary,
    /// Not part of the topology yet; stand by until configured.
    #[default]
    Unconfigured,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Secondary => write!(f, "secondary"),
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Unconfigured => write!(f, "unconfigured"),
        }
    }
}

/// Identity and role of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node, used in logs and metrics.
    pub node_id: String,

    /// Role in the replication topology.
    #[serde(default)]
    pub role: NodeRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.cursor".to_string(),
            role: NodeRole::Unconfigured,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollConfig: loop cadence
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Sleep between loop iterations, as a humantime string.
    #[serde(default = "default_poll_interval")]
    pub interval: String,

    /// Multiplicative jitter applied to the poll interval, in `[0.0, 1.0]`.
    /// An interval of 5s with 0.2 jitter sleeps between 5s and 6s.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Sleep when the node is not an active secondary.
    #[serde(default = "default_standby_backoff")]
    pub standby_backoff: String,

    /// Maximum events fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_standby_backoff() -> String {
    "1m".to_string()
}

fn default_batch_size() -> usize {
    1000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            jitter_fraction: default_jitter_fraction(),
            standby_backoff: default_standby_backoff(),
            batch_size: default_batch_size(),
        }
    }
}

impl PollConfig {
    /// Parse the poll interval, falling back to 5 seconds.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    /// Parse the standby backoff, falling back to 1 minute.
    pub fn standby_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.standby_backoff).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaseConfig: single-active-cursor election
// ═══════════════════════════════════════════════════════════════════════════════

/// Exclusive lease configuration.
///
/// The lease key is a fixed well-known string, not per-replica: the cursor
/// is a global singleton per deployment by design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease key shared by every cursor process in the deployment.
    #[serde(default = "default_lease_key")]
    pub key: String,

    /// Lease TTL; bounds how long a crashed holder can block others.
    /// The daemon renews once per batch, so the TTL should exceed a
    /// worst-case batch duration.
    #[serde(default = "default_lease_ttl")]
    pub ttl: String,

    /// Redis URL for the production lease backend. When absent the
    /// standalone binary falls back to an in-process lease (single-node
    /// deployments only).
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_lease_key() -> String {
    "log_cursor:leader".to_string()
}

fn default_lease_ttl() -> String {
    "30s".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key: default_lease_key(),
            ttl: default_lease_ttl(),
            redis_url: None,
        }
    }
}

impl LeaseConfig {
    /// Parse the lease TTL, falling back to 30 seconds.
    pub fn ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.ttl).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GapConfig: out-of-order tolerance
// ═══════════════════════════════════════════════════════════════════════════════

/// Gap tracking thresholds.
///
/// A "gap" is an event ID below the high-water mark that has never been
/// observed. Gaps younger than `age_threshold` are left alone (normal
/// commit-visibility skew). Once past the threshold the log is re-queried
/// each cycle; a gap still absent past `hard_ceiling` is dropped for good
/// and logged as data loss. With the two set equal (the default), a gap is
/// dropped on the first failed re-query past the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Age before a missing ID is first re-queried from the log.
    #[serde(default = "default_gap_age_threshold")]
    pub age_threshold: String,

    /// Age past which a still-missing ID is permanently abandoned.
    #[serde(default = "default_gap_hard_ceiling")]
    pub hard_ceiling: String,

    /// Upper bound on tracked gaps; overflow evicts the oldest IDs with a
    /// data-loss warning. Bounds memory when the log is badly fragmented.
    #[serde(default = "default_max_tracked_gaps")]
    pub max_tracked: usize,
}

fn default_gap_age_threshold() -> String {
    "10m".to_string()
}

fn default_gap_hard_ceiling() -> String {
    "10m".to_string()
}

fn default_max_tracked_gaps() -> usize {
    10_000
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            age_threshold: default_gap_age_threshold(),
            hard_ceiling: default_gap_hard_ceiling(),
            max_tracked: default_max_tracked_gaps(),
        }
    }
}

impl GapConfig {
    /// Parse the age threshold, falling back to 10 minutes.
    pub fn age_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.age_threshold).unwrap_or(Duration::from_secs(600))
    }

    /// Parse the hard ceiling, falling back to the age threshold.
    ///
    /// The ceiling is clamped to at least the threshold so re-querying can
    /// never outlive abandonment.
    pub fn hard_ceiling_duration(&self) -> Duration {
        let threshold = self.age_threshold_duration();
        humantime::parse_duration(&self.hard_ceiling)
            .map(|d| d.max(threshold))
            .unwrap_or(threshold)
    }

    /// Fast thresholds for tests.
    pub fn for_testing() -> Self {
        Self {
            age_threshold: "100ms".to_string(),
            hard_ceiling: "100ms".to_string(),
            max_tracked: 100,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FailureConfig: bounded error-streak escalation
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// Maximum wall-clock duration of a consecutive-failure streak before
    /// the daemon gives up and exits for supervised restart.
    #[serde(default = "default_max_error_duration")]
    pub max_error_duration: String,
}

fn default_max_error_duration() -> String {
    "10m".to_string()
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            max_error_duration: default_max_error_duration(),
        }
    }
}

impl FailureConfig {
    /// Parse the max error duration, falling back to 10 minutes.
    pub fn max_error_duration_value(&self) -> Duration {
        humantime::parse_duration(&self.max_error_duration).unwrap_or(Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Event log / cursor position persistence configuration.
///
/// Both the replicated log and the singleton cursor position row live in
/// one SQLite database. The in-memory gap buffer is deliberately NOT
/// persisted: restarts lose in-flight gap state, which is acceptable
/// because gaps are rare and bounded by the age window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "event_log.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
