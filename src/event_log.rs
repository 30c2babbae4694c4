// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event log reader and durable cursor position.
//!
//! The replicated log and the cursor position live in one SQLite database:
//!
//! - `event_log`: append-only rows produced by the primary. The cursor only
//!   reads it (plus the producer-side [`EventStore::append`] used by the
//!   primary writer and by tests).
//! - `cursor_position`: a singleton row holding `last_processed_event_id`,
//!   owned exclusively by the cursor process.
//!
//! # At-Least-Once Semantics
//!
//! The position is advanced only after a batch has been fully handled:
//!
//! ```text
//! fetch batch (id > position) → sink.handle(batch) → persist position
//!                               (crash here = whole batch redelivered)
//! ```
//!
//! The write is synchronous, not fire-and-forget. A crash between "handled"
//! and "position saved" redelivers the batch on restart, so handlers must
//! be idempotent. The cursor provides no deduplication beyond the position.
//!
//! # Bootstrap
//!
//! If no `cursor_position` row exists there is nothing to resume from and
//! [`fetch_in_batches`](EventStore::fetch_in_batches) is a no-op. An
//! operator bootstraps the position explicitly via [`EventStore::bootstrap`].
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED is retried with capped exponential backoff
//! (max 5 attempts). WAL mode keeps position writes cheap and durable.

use crate::error::{CursorError, Result};
use crate::handler::BoxFuture;
use crate::metrics;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// One replicated change, produced by the primary.
///
/// Immutable from the cursor's perspective: never mutated or deleted here.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    /// Monotonic ordering key. Gaps are possible (rolled-back producer
    /// transactions, commit-visibility skew).
    pub id: i64,
    /// Discriminator selecting a handler.
    pub event_type: String,
    /// Opaque type-specific data. `None` models malformed or placeholder
    /// rows, which the daemon skips without error.
    pub payload: Option<serde_json::Value>,
    /// Producer-side creation time, unix millis. Basis for the
    /// `cursor_delay_seconds` metric.
    pub created_at_ms: i64,
}

impl EventLogEntry {
    /// Age of this event relative to the local clock, in seconds.
    ///
    /// Can be slightly negative under clock skew; callers record it as-is.
    pub fn delay_seconds(&self) -> f64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        (now_ms - self.created_at_ms) as f64 / 1000.0
    }
}

/// Control flow signal returned by a [`BatchSink`] after each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    /// Batch fully handled; fetch the next one.
    Continue,
    /// Batch fully handled; advance the position but stop fetching.
    Stop,
}

/// Receiver for batches yielded by [`EventStore::fetch_in_batches`].
///
/// The contract mirrors the at-least-once guarantee: returning `Ok(_)`
/// asserts the whole batch was handled, after which the store durably
/// advances the position. A sink that must abandon a batch midway (for
/// example on shutdown) returns `Err(CursorError::Shutdown)` so the
/// position is left untouched and the batch is redelivered later.
pub trait BatchSink: Send {
    /// Handle one batch. `previous_last_id` is the durable position the
    /// batch was fetched after; the gap tracker is seeded with it.
    fn handle<'a>(
        &'a mut self,
        batch: Vec<EventLogEntry>,
        previous_last_id: i64,
    ) -> BoxFuture<'a, Result<BatchControl>>;
}

/// SQLite-backed event log reader with a durable singleton cursor position.
pub struct EventStore {
    pool: SqlitePool,
    path: String,
    /// Log read counter (batches + gap lookups), exposed for diagnostics.
    reads: AtomicU64,
}

impl EventStore {
    /// Open (or create) the store at the given path, in WAL mode.
    ///
    /// `":memory:"` opens a private in-memory database (tests).
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_wal(path, true).await
    }

    /// Open the store as described by the persistence config.
    pub async fn open(config: &crate::config::StoreConfig) -> Result<Self> {
        Self::with_wal(&config.sqlite_path, config.wal_mode).await
    }

    async fn with_wal(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, wal_mode, "Opening event store");

        let options = if path_str == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| CursorError::Config(format!("Invalid SQLite options: {}", e)))?
        } else {
            let journal = if wal_mode {
                sqlx::sqlite::SqliteJournalMode::Wal
            } else {
                sqlx::sqlite::SqliteJournalMode::Delete
            };
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| CursorError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true)
        };

        // A single connection: the cursor is strictly sequential, and an
        // in-memory database must not be split across connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                payload TEXT,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursor_position (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                last_processed_event_id INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
            reads: AtomicU64::new(0),
        })
    }

    /// The durably persisted position, or `None` if never bootstrapped.
    pub async fn position(&self) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_processed_event_id FROM cursor_position WHERE slot = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Create the position row if absent. Returns `true` if this call
    /// created it. Operator bootstrap; never overwrites an existing row.
    pub async fn bootstrap(&self, last_processed_event_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO cursor_position (slot, last_processed_event_id) VALUES (0, ?)",
        )
        .bind(last_processed_event_id)
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected() > 0;
        if created {
            info!(last_processed_event_id, "Bootstrapped cursor position");
        }
        Ok(created)
    }

    /// Durably advance the position. Retries on SQLITE_BUSY.
    async fn set_position(&self, last_processed_event_id: i64) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("set_position", || async {
            sqlx::query("UPDATE cursor_position SET last_processed_event_id = ? WHERE slot = 0")
                .bind(last_processed_event_id)
                .execute(pool)
                .await
        })
        .await?;
        metrics::set_cursor_position(last_processed_event_id);
        debug!(last_processed_event_id, "Cursor position advanced");
        Ok(())
    }

    /// Fetch up to `limit` events with `id > after`, ascending.
    async fn next_batch(&self, after: i64, limit: usize) -> Result<Vec<EventLogEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let rows: Vec<(i64, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT id, event_type, payload, created_at_ms FROM event_log \
             WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    /// Look up a single event by ID. Used by gap filling.
    pub async fn find_event(&self, id: i64) -> Result<Option<EventLogEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let row: Option<(i64, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT id, event_type, payload, created_at_ms FROM event_log WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_entry))
    }

    /// Number of log reads issued so far (diagnostics).
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total rows in the log (diagnostics).
    pub async fn event_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Producer-side append with an auto-assigned ID. Returns the new ID.
    pub async fn append(
        &self,
        event_type: &str,
        payload: Option<&serde_json::Value>,
        created_at_ms: i64,
    ) -> Result<i64> {
        let payload_text = payload.map(|p| p.to_string());
        let result =
            sqlx::query("INSERT INTO event_log (event_type, payload, created_at_ms) VALUES (?, ?, ?)")
                .bind(event_type)
                .bind(payload_text)
                .bind(created_at_ms)
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    /// Producer-side append with an explicit ID. The producer assigns IDs
    /// monotonically; explicit assignment is how rolled-back transactions
    /// leave holes in the sequence.
    pub async fn append_with_id(
        &self,
        id: i64,
        event_type: &str,
        payload: Option<&serde_json::Value>,
        created_at_ms: i64,
    ) -> Result<()> {
        let payload_text = payload.map(|p| p.to_string());
        sqlx::query(
            "INSERT INTO event_log (id, event_type, payload, created_at_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(event_type)
        .bind(payload_text)
        .bind(created_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pull batches of unprocessed events and feed them to `sink`,
    /// durably advancing the position after each fully handled batch.
    ///
    /// No-op when the position was never bootstrapped (nothing to resume
    /// from). Returns the number of events yielded. The position is NOT
    /// advanced when the sink returns an error, which is how a crash or a
    /// mid-batch shutdown produces redelivery instead of loss.
    pub async fn fetch_in_batches(
        &self,
        batch_size: usize,
        sink: &mut dyn BatchSink,
    ) -> Result<u64> {
        let mut position = match self.position().await? {
            Some(p) => p,
            None => {
                debug!("No cursor position bootstrapped, nothing to resume from");
                return Ok(0);
            }
        };

        let mut yielded: u64 = 0;
        loop {
            let batch = self.next_batch(position, batch_size).await?;
            if batch.is_empty() {
                break;
            }

            // last() is safe: the batch is non-empty and ordered ascending.
            let last_id = batch.last().map(|e| e.id).unwrap_or(position);
            let count = batch.len();
            metrics::record_batch_fetched(count);

            let control = sink.handle(batch, position).await?;
            self.set_position(last_id).await?;
            yielded += count as u64;
            position = last_id;

            match control {
                BatchControl::Continue => continue,
                BatchControl::Stop => break,
            }
        }
        Ok(yielded)
    }

    /// Get the database path (diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Event store closed");
    }
}

fn row_to_entry(row: (i64, String, Option<String>, i64)) -> EventLogEntry {
    let (id, event_type, payload_text, created_at_ms) = row;
    let payload = payload_text.and_then(|text| match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            // A corrupt payload is treated like a placeholder row: the
            // daemon skips it rather than wedging the whole stream.
            warn!(event_id = id, error = %e, "Discarding unparseable event payload");
            None
        }
    });
    EventLogEntry {
        id,
        event_type,
        payload,
        created_at_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Sink that records everything it receives.
    struct RecordingSink {
        batches: Vec<(Vec<i64>, i64)>,
        control: BatchControl,
        fail_on_id: Option<i64>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Vec::new(),
                control: BatchControl::Continue,
                fail_on_id: None,
            }
        }
    }

    impl BatchSink for RecordingSink {
        fn handle<'a>(
            &'a mut self,
            batch: Vec<EventLogEntry>,
            previous_last_id: i64,
        ) -> BoxFuture<'a, Result<BatchControl>> {
            Box::pin(async move {
                let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
                if let Some(bad) = self.fail_on_id {
                    if ids.contains(&bad) {
                        return Err(CursorError::Internal("boom".to_string()));
                    }
                }
                self.batches.push((ids, previous_last_id));
                Ok(self.control)
            })
        }
    }

    #[tokio::test]
    async fn test_bootstrap_and_position() {
        let store = EventStore::new(":memory:").await.unwrap();
        assert_eq!(store.position().await.unwrap(), None);

        assert!(store.bootstrap(0).await.unwrap());
        assert_eq!(store.position().await.unwrap(), Some(0));

        // Second bootstrap must not overwrite.
        assert!(!store.bootstrap(99).await.unwrap());
        assert_eq!(store.position().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_fetch_is_noop_without_bootstrap() {
        let store = EventStore::new(":memory:").await.unwrap();
        store.append("a", None, now_ms()).await.unwrap();

        let mut sink = RecordingSink::new();
        let yielded = store.fetch_in_batches(10, &mut sink).await.unwrap();
        assert_eq!(yielded, 0);
        assert!(sink.batches.is_empty());
        assert_eq!(store.position().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_in_batches_ordered_and_advances() {
        let store = EventStore::new(":memory:").await.unwrap();
        store.bootstrap(0).await.unwrap();
        for _ in 0..5 {
            store
                .append("a", Some(&json!({"k": 1})), now_ms())
                .await
                .unwrap();
        }

        let mut sink = RecordingSink::new();
        let yielded = store.fetch_in_batches(2, &mut sink).await.unwrap();
        assert_eq!(yielded, 5);

        // Batches of 2, 2, 1 with previous_last_id tracking the position.
        assert_eq!(sink.batches.len(), 3);
        assert_eq!(sink.batches[0], (vec![1, 2], 0));
        assert_eq!(sink.batches[1], (vec![3, 4], 2));
        assert_eq!(sink.batches[2], (vec![5], 4));
        assert_eq!(store.position().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_advance_position() {
        let store = EventStore::new(":memory:").await.unwrap();
        store.bootstrap(0).await.unwrap();
        for _ in 0..4 {
            store.append("a", Some(&json!({})), now_ms()).await.unwrap();
        }

        let mut sink = RecordingSink::new();
        sink.fail_on_id = Some(3);
        let result = store.fetch_in_batches(2, &mut sink).await;
        assert!(result.is_err());

        // First batch [1,2] succeeded and advanced; [3,4] failed and did not.
        assert_eq!(store.position().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sink_stop_halts_after_current_batch() {
        let store = EventStore::new(":memory:").await.unwrap();
        store.bootstrap(0).await.unwrap();
        for _ in 0..4 {
            store.append("a", Some(&json!({})), now_ms()).await.unwrap();
        }

        let mut sink = RecordingSink::new();
        sink.control = BatchControl::Stop;
        let yielded = store.fetch_in_batches(2, &mut sink).await.unwrap();

        // One batch handled and persisted, then the loop stopped.
        assert_eq!(yielded, 2);
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(store.position().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_find_event_and_gaps_in_ids() {
        let store = EventStore::new(":memory:").await.unwrap();
        store.append_with_id(101, "a", Some(&json!({})), now_ms()).await.unwrap();
        store.append_with_id(104, "a", Some(&json!({})), now_ms()).await.unwrap();

        assert!(store.find_event(101).await.unwrap().is_some());
        assert!(store.find_event(103).await.unwrap().is_none());
        assert!(store.find_event(104).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_payload_becomes_none() {
        let store = EventStore::new(":memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO event_log (id, event_type, payload, created_at_ms) VALUES (1, 'a', 'not json', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let entry = store.find_event(1).await.unwrap().unwrap();
        assert!(entry.payload.is_none());
    }

    #[tokio::test]
    async fn test_payload_roundtrip() {
        let store = EventStore::new(":memory:").await.unwrap();
        let payload = json!({"project_id": 7, "path": "group/repo"});
        let id = store.append("repository_updated", Some(&payload), 1234).await.unwrap();

        let entry = store.find_event(id).await.unwrap().unwrap();
        assert_eq!(entry.event_type, "repository_updated");
        assert_eq!(entry.payload, Some(payload));
        assert_eq!(entry.created_at_ms, 1234);
    }

    #[tokio::test]
    async fn test_read_count_increments() {
        let store = EventStore::new(":memory:").await.unwrap();
        assert_eq!(store.read_count(), 0);
        let _ = store.find_event(1).await.unwrap();
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("events.db");

        {
            let store = EventStore::new(&db_path).await.unwrap();
            store.bootstrap(0).await.unwrap();
            store.append("a", Some(&json!({})), now_ms()).await.unwrap();
            let mut sink = RecordingSink::new();
            store.fetch_in_batches(10, &mut sink).await.unwrap();
            assert_eq!(store.position().await.unwrap(), Some(1));
            store.close().await;
        }

        {
            let store = EventStore::new(&db_path).await.unwrap();
            assert_eq!(store.position().await.unwrap(), Some(1));
            assert_eq!(store.event_count().await.unwrap(), 1);
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_delay_seconds_reasonable() {
        let entry = EventLogEntry {
            id: 1,
            event_type: "a".to_string(),
            payload: None,
            created_at_ms: chrono::Utc::now().timestamp_millis() - 2_000,
        };
        let delay = entry.delay_seconds();
        assert!(delay >= 1.5 && delay < 10.0, "delay was {}", delay);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempts = 0;
        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test_op", || {
                attempts += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
