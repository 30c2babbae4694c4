//! Shared fixtures for integration tests.

use log_cursor::handler::BoxFuture;
use log_cursor::{EventHandler, EventLogEntry, EventStore, HandlerError};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Handler that records the IDs it applied, in order.
#[derive(Default)]
pub struct RecordingHandler {
    pub applied: Mutex<Vec<i64>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_ids(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn apply<'a>(
        &'a self,
        _payload: &'a serde_json::Value,
        entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.applied.lock().unwrap().push(entry.id);
            Ok(())
        })
    }
}

/// Handler that fails the first `failures` calls, then behaves like a
/// recorder. Exercises redelivery.
pub struct FlakyHandler {
    remaining_failures: AtomicUsize,
    pub applied: Mutex<Vec<i64>>,
}

impl FlakyHandler {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(failures),
            applied: Mutex::new(Vec::new()),
        })
    }

    pub fn applied_ids(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

impl EventHandler for FlakyHandler {
    fn apply<'a>(
        &'a self,
        _payload: &'a serde_json::Value,
        entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let prev = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n > 0 {
                        Some(n - 1)
                    } else {
                        None
                    }
                });
            if prev.is_ok() {
                return Err(HandlerError("simulated transient failure".to_string()));
            }
            self.applied.lock().unwrap().push(entry.id);
            Ok(())
        })
    }
}

/// Handler that fails the first attempt on one specific event ID and
/// records everything else. Exercises redelivery of recovered gap events.
pub struct FailOnceOnIdHandler {
    target: i64,
    failed: AtomicBool,
    pub applied: Mutex<Vec<i64>>,
}

impl FailOnceOnIdHandler {
    pub fn new(target: i64) -> Arc<Self> {
        Arc::new(Self {
            target,
            failed: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        })
    }

    pub fn applied_ids(&self) -> Vec<i64> {
        self.applied.lock().unwrap().clone()
    }
}

impl EventHandler for FailOnceOnIdHandler {
    fn apply<'a>(
        &'a self,
        _payload: &'a serde_json::Value,
        entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if entry.id == self.target && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(HandlerError("simulated transient failure".to_string()));
            }
            self.applied.lock().unwrap().push(entry.id);
            Ok(())
        })
    }
}

/// Handler that never succeeds. Exercises failure escalation.
pub struct AlwaysFailingHandler {
    pub attempts: AtomicUsize,
}

impl AlwaysFailingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
        })
    }
}

impl EventHandler for AlwaysFailingHandler {
    fn apply<'a>(
        &'a self,
        _payload: &'a serde_json::Value,
        _entry: &'a EventLogEntry,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError("permanently broken".to_string()))
        })
    }
}

pub async fn in_memory_store() -> Arc<EventStore> {
    Arc::new(EventStore::new(":memory:").await.unwrap())
}

/// Append `count` events of the given type with fresh timestamps.
pub async fn append_events(store: &EventStore, event_type: &str, count: usize) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    for _ in 0..count {
        store
            .append(event_type, Some(&json!({"k": 1})), now_ms)
            .await
            .unwrap();
    }
}

/// Append one event with an explicit ID, leaving earlier IDs as gaps.
pub async fn append_event_with_id(store: &EventStore, id: i64, event_type: &str) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    store
        .append_with_id(id, event_type, Some(&json!({"k": 1})), now_ms)
        .await
        .unwrap();
}
