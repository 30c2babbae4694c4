// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The log cursor daemon: poll loop, lease election, batch processing,
//! failure escalation.
//!
//! One iteration of the loop:
//!
//! ```text
//! role check ──not secondary──▶ standby backoff
//!     │
//! try_obtain lease ──contended──▶ poll backoff
//!     │
//! fetch batches ▶ per event: gap check ▶ dispatch ▶ advance position
//!     │
//! re-query aged gaps, replay recovered events
//! ```
//!
//! Transient errors are tolerated while the consecutive-failure streak is
//! younger than the configured window; one success resets the streak. A
//! fatal error, or a streak outliving the window, ends [`Daemon::run`] with
//! [`ExitReason::FatalError`] so a supervisor can restart the process. The
//! library never calls `process::exit`; the binary maps the exit reason to
//! a process exit code.

use crate::config::{CursorConfig, NodeRole};
use crate::error::{CursorError, Result};
use crate::event_log::{BatchControl, BatchSink, EventLogEntry, EventStore};
use crate::gap_tracking::GapTracker;
use crate::handler::{BoxFuture, Dispatch, HandlerRegistry};
use crate::lease::{LeaseService, LeaseToken};
use crate::metrics;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Observable daemon state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Between iterations, or waiting out a backoff.
    Idle,
    /// Holding the lease, about to process.
    Leased,
    /// Actively applying a batch.
    Processing,
    /// Shut down cleanly.
    Stopped,
    /// Gave up after a fatal error or an exhausted failure window.
    Failed,
}

impl std::fmt::Display for CursorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorState::Idle => write!(f, "idle"),
            CursorState::Leased => write!(f, "leased"),
            CursorState::Processing => write!(f, "processing"),
            CursorState::Stopped => write!(f, "stopped"),
            CursorState::Failed => write!(f, "failed"),
        }
    }
}

/// What a single loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Node is not an active secondary; nothing was attempted.
    Standby,
    /// Another process holds the lease.
    NotLeader,
    /// Held the lease and processed this many events (possibly zero).
    Processed { events: u64 },
}

/// Why [`Daemon::run`] returned.
#[derive(Debug)]
pub enum ExitReason {
    /// Cooperative shutdown was requested.
    ShutdownRequested,
    /// A fatal error, or a consecutive-failure streak longer than the
    /// configured window. The supervisor should restart the process.
    FatalError(CursorError),
}

/// Single-writer event log cursor.
///
/// Owns the poll loop. Library consumers embed it with real handlers; the
/// standalone binary runs it with log-only handlers.
pub struct Daemon {
    config: CursorConfig,
    store: Arc<EventStore>,
    lease: Arc<dyn LeaseService>,
    registry: HandlerRegistry,
    gaps: GapTracker,
    state_tx: watch::Sender<CursorState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Start of the current consecutive-failure streak. Reset by any
    /// successful iteration.
    first_failure_at: Option<Instant>,
    /// Token for the lease currently held, if any.
    current_token: Option<LeaseToken>,
}

impl Daemon {
    pub fn new(
        config: CursorConfig,
        store: Arc<EventStore>,
        lease: Arc<dyn LeaseService>,
        registry: HandlerRegistry,
    ) -> Self {
        let gaps = GapTracker::new(
            config.gaps.age_threshold_duration(),
            config.gaps.hard_ceiling_duration(),
            config.gaps.max_tracked,
        );
        let (state_tx, _) = watch::channel(CursorState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            store,
            lease,
            registry,
            gaps,
            state_tx,
            shutdown_tx,
            shutdown_rx,
            first_failure_at: None,
            current_token: None,
        }
    }

    /// Handle for requesting cooperative shutdown: `handle.send(true)`.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Subscribe to state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<CursorState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> CursorState {
        *self.state_tx.borrow()
    }

    /// The gap tracker, exposed for observability.
    pub fn gap_tracker(&self) -> &GapTracker {
        &self.gaps
    }

    fn set_state(&self, state: CursorState) {
        metrics::set_daemon_state(&state.to_string());
        // send() only fails with no receivers, which is fine: the channel
        // is observability, not control flow.
        let _ = self.state_tx.send(state);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run the poll loop until shutdown or a fatal condition.
    pub async fn run(&mut self) -> ExitReason {
        info!(
            node_id = %self.config.node.node_id,
            role = %self.config.node.role,
            lease_key = %self.config.lease.key,
            "Log cursor daemon starting"
        );

        loop {
            if self.shutdown_requested() {
                return self.stop().await;
            }

            match self.run_once().await {
                Ok(outcome) => {
                    self.first_failure_at = None;
                    let delay = match outcome {
                        RunOutcome::Standby => self.config.poll.standby_backoff_duration(),
                        _ => self.jittered_poll_interval(),
                    };
                    if self.sleep_or_shutdown(delay).await {
                        return self.stop().await;
                    }
                }
                Err(CursorError::Shutdown) => {
                    return self.stop().await;
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, daemon giving up");
                    self.set_state(CursorState::Failed);
                    return ExitReason::FatalError(e);
                }
                Err(e) => {
                    let now = Instant::now();
                    let streak_started = *self.first_failure_at.get_or_insert(now);
                    let streak = now.duration_since(streak_started);
                    let window = self.config.failure.max_error_duration_value();
                    metrics::record_failure(error_kind(&e));

                    if streak >= window {
                        error!(
                            error = %e,
                            streak_secs = streak.as_secs(),
                            window_secs = window.as_secs(),
                            "Consecutive failures exceeded the error window, daemon giving up"
                        );
                        self.set_state(CursorState::Failed);
                        return ExitReason::FatalError(e);
                    }

                    warn!(
                        error = %e,
                        streak_secs = streak.as_secs(),
                        window_secs = window.as_secs(),
                        "Iteration failed, will retry"
                    );
                    if self.sleep_or_shutdown(self.jittered_poll_interval()).await {
                        return self.stop().await;
                    }
                }
            }
        }
    }

    /// One loop iteration: role gate, lease election, batch processing.
    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        if self.config.node.role != NodeRole::Secondary {
            debug!(role = %self.config.node.role, "Not an active secondary, standing by");
            return Ok(RunOutcome::Standby);
        }

        match self.lease.try_obtain().await? {
            None => {
                metrics::record_lease_attempt(false);
                debug!("Lease held by another process, backing off");
                Ok(RunOutcome::NotLeader)
            }
            Some(token) => {
                metrics::record_lease_attempt(true);
                self.current_token = Some(token);
                self.set_state(CursorState::Leased);
                let result = self.find_and_handle_events().await;
                self.set_state(CursorState::Idle);
                result.map(|events| RunOutcome::Processed { events })
            }
        }
    }

    /// Process all pending batches, then sweep aged gaps.
    async fn find_and_handle_events(&mut self) -> Result<u64> {
        self.set_state(CursorState::Processing);

        let store = Arc::clone(&self.store);
        let mut events = store
            .fetch_in_batches(self.config.poll.batch_size, self)
            .await?;

        // Recovered late events are applied outside the position flow:
        // their IDs are already below the persisted position. The gap is
        // closed only after a successful apply; a handler failure leaves
        // it tracked so the event is redelivered on the next sweep rather
        // than silently lost.
        let recovered = self.gaps.fill_gaps(store.as_ref()).await?;
        for entry in &recovered {
            if self.shutdown_requested() {
                return Err(CursorError::Shutdown);
            }
            self.handle_single_event(entry).await?;
            self.gaps.resolve(entry.id);
            events += 1;
        }

        Ok(events)
    }

    /// Apply one event through its registered handler.
    async fn handle_single_event(&self, entry: &EventLogEntry) -> Result<()> {
        let payload = match &entry.payload {
            Some(p) => p,
            None => {
                debug!(
                    event_id = entry.id,
                    event_type = %entry.event_type,
                    "Event has no payload, skipping"
                );
                metrics::record_event_skipped(&entry.event_type, "empty_payload");
                return Ok(());
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        let delay_seconds = entry.delay_seconds();
        metrics::record_cursor_delay(&entry.event_type, delay_seconds);

        let span = info_span!(
            "process_event",
            event_id = entry.id,
            event_type = %entry.event_type,
            correlation_id = %correlation_id,
            cursor_delay_seconds = delay_seconds,
        );

        let dispatch = async {
            match self
                .registry
                .dispatch(entry, payload, &correlation_id)
                .await
            {
                Ok(Dispatch::Applied) => {
                    metrics::record_event_applied(&entry.event_type);
                    debug!("Event applied");
                    Ok(())
                }
                Ok(Dispatch::SkippedPolicy) => {
                    metrics::record_event_skipped(&entry.event_type, "policy_disabled");
                    Ok(())
                }
                Err(e @ CursorError::UnknownEventType { .. }) => {
                    error!(error = %e, "No handler registered for event type");
                    Err(e)
                }
                Err(e) => Err(e),
            }
        };

        dispatch.instrument(span).await
    }

    /// Poll interval with multiplicative jitter, so multiple standby
    /// processes do not hammer the lease in lockstep.
    fn jittered_poll_interval(&self) -> Duration {
        let base = self.config.poll.interval_duration();
        let jitter = self.config.poll.jitter_fraction;
        if jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(factor)
    }

    /// Sleep for `delay`, waking early on shutdown. Returns `true` when
    /// shutdown was requested.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => true,
            _ = tokio::time::sleep(delay) => self.shutdown_requested(),
        }
    }

    /// Clean shutdown: release the lease if held, publish the final state.
    async fn stop(&mut self) -> ExitReason {
        if let Some(token) = self.current_token.take() {
            if let Err(e) = self.lease.release(&token).await {
                warn!(error = %e, "Failed to release lease on shutdown");
            }
        }
        self.set_state(CursorState::Stopped);
        info!(node_id = %self.config.node.node_id, "Log cursor daemon stopped");
        ExitReason::ShutdownRequested
    }
}

/// Per-batch sink: renew the lease, track gaps, dispatch every event.
///
/// Returning an error abandons the batch without advancing the position,
/// which is what shutdown, lease loss, and handler failures all want.
impl BatchSink for Daemon {
    fn handle<'a>(
        &'a mut self,
        batch: Vec<EventLogEntry>,
        previous_last_id: i64,
    ) -> BoxFuture<'a, Result<BatchControl>> {
        Box::pin(async move {
            let token = self
                .current_token
                .clone()
                .ok_or_else(|| CursorError::InvalidState {
                    expected: "lease held".to_string(),
                    actual: "no lease token".to_string(),
                })?;

            // Long batches can outlive the lease TTL; renew up front so a
            // slow handler cannot silently lose exclusivity mid-batch.
            if !self.lease.renew(&token).await? {
                self.current_token = None;
                return Err(CursorError::LeaseLost);
            }

            self.gaps.set_previous_id(previous_last_id);

            for entry in &batch {
                if self.shutdown_requested() {
                    return Err(CursorError::Shutdown);
                }
                self.gaps.check(entry.id);
                self.handle_single_event(entry).await?;
            }

            Ok(BatchControl::Continue)
        })
    }
}

fn error_kind(e: &CursorError) -> &'static str {
    match e {
        CursorError::EventStore(_) => "event_store",
        CursorError::Lease { .. } => "lease",
        CursorError::LeaseLost => "lease_lost",
        CursorError::UnknownEventType { .. } => "unknown_event_type",
        CursorError::Handler { .. } => "handler",
        CursorError::Config(_) => "config",
        CursorError::InvalidState { .. } => "invalid_state",
        CursorError::Shutdown => "shutdown",
        CursorError::Internal(_) => "internal",
    }
}
