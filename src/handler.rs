// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event handler trait and type-based dispatch.
//!
//! Every event type the cursor is willing to process has a registered
//! [`EventHandler`]. Dispatch is strict: an event type with no handler is
//! an error, because silently skipping it would permanently advance the
//! position past work that was never done.
//!
//! Handlers MUST be idempotent. The cursor guarantees at-least-once
//! delivery, so any handler can see the same event twice after a crash or
//! a redelivered batch.

use crate::error::{CursorError, Result};
use crate::event_log::EventLogEntry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure applying a single event. Carries a human-readable message;
/// the dispatcher attaches the event identity.
#[derive(Debug)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Applies one kind of replicated event on the local replica.
pub trait EventHandler: Send + Sync + 'static {
    /// Apply the event. Must be idempotent.
    fn apply<'a>(
        &'a self,
        payload: &'a serde_json::Value,
        entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>>;

    /// Policy gate checked before every apply. Lets deployments disable an
    /// event type (staged rollouts, incident mitigation) without
    /// unregistering the handler; disabled events are skipped, not errors.
    fn enabled(&self) -> bool {
        true
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handler ran to completion.
    Applied,
    /// Handler exists but is disabled by policy.
    SkippedPolicy,
}

/// Maps event types to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, "Registered event handler");
        self.handlers.insert(event_type, handler);
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatch one event to its handler.
    pub async fn dispatch(
        &self,
        entry: &EventLogEntry,
        payload: &serde_json::Value,
        correlation_id: &str,
    ) -> Result<Dispatch> {
        let handler = self.handlers.get(&entry.event_type).ok_or_else(|| {
            CursorError::UnknownEventType {
                event_type: entry.event_type.clone(),
                event_id: entry.id,
                correlation_id: correlation_id.to_string(),
            }
        })?;

        if !handler.enabled() {
            debug!(
                event_id = entry.id,
                event_type = %entry.event_type,
                "Handler disabled by policy, skipping event"
            );
            return Ok(Dispatch::SkippedPolicy);
        }

        handler
            .apply(payload, entry)
            .await
            .map_err(|e| CursorError::Handler {
                event_type: entry.event_type.clone(),
                event_id: entry.id,
                message: e.0,
            })?;

        Ok(Dispatch::Applied)
    }
}

/// Handler that only logs. Used for event types configured as log-only and
/// for dry-run deployments where no replication side effects are wanted.
pub struct NoOpHandler;

impl EventHandler for NoOpHandler {
    fn apply<'a>(
        &'a self,
        payload: &'a serde_json::Value,
        entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>> {
        Box::pin(async move {
            info!(
                event_id = entry.id,
                event_type = %entry.event_type,
                payload = %payload,
                "Would apply event (no-op handler)"
            );
            Ok(())
        })
    }
}
