//! In-memory tracking of gaps in the event ID sequence.
//!
//! Event IDs are assigned monotonically by the producer, but rolled-back
//! transactions and commit-visibility skew leave holes: the cursor can see
//! ID 104 before 103 exists, or instead of a 103 that will never exist.
//!
//! The tracker remembers every missing ID below the highest ID seen, with
//! the time it was first noticed. Aged gaps are re-queried against the log;
//! gaps that stay absent past a hard ceiling are dropped with a data-loss
//! warning. State is deliberately NOT persisted: a restart forgets all
//! tracked gaps, trading unbounded recovery state for a small chance of
//! missing an extremely late event.
//!
//! Uses `tokio::time::Instant` so tests can drive expiry with paused time.

use crate::error::Result;
use crate::event_log::{EventLogEntry, EventStore};
use crate::metrics;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct GapTracker {
    /// Highest event ID observed so far. IDs at or below this that were
    /// never seen are gaps.
    previous_id: Option<i64>,
    /// Missing IDs keyed to when they were first noticed.
    missing: BTreeMap<i64, Instant>,
    /// Gaps older than this are re-queried against the log.
    age_threshold: Duration,
    /// Gaps older than this that are still absent are dropped for good.
    hard_ceiling: Duration,
    /// Cap on tracked gaps. The oldest (smallest) IDs are evicted first.
    max_tracked: usize,
}

impl GapTracker {
    pub fn new(age_threshold: Duration, hard_ceiling: Duration, max_tracked: usize) -> Self {
        Self {
            previous_id: None,
            missing: BTreeMap::new(),
            // The ceiling can never undercut the threshold or gaps would be
            // dropped before ever being re-queried.
            hard_ceiling: hard_ceiling.max(age_threshold),
            age_threshold,
            max_tracked,
        }
    }

    /// Seed or advance the high-water mark without implying gaps.
    ///
    /// Called with the durable position before a batch so that the first
    /// event after a restart is compared against the persisted position,
    /// not against nothing.
    pub fn set_previous_id(&mut self, id: i64) {
        match self.previous_id {
            Some(prev) if prev >= id => {}
            _ => self.previous_id = Some(id),
        }
    }

    /// Observe one event ID in arrival order.
    ///
    /// A jump past `previous_id + 1` records the skipped IDs as gaps; an ID
    /// that was previously missing fills its gap.
    pub fn check(&mut self, id: i64) {
        if self.missing.remove(&id).is_some() {
            debug!(event_id = id, "Late event filled a tracked gap");
            metrics::record_gap_filled();
            metrics::set_tracked_gaps(self.missing.len());
            // A late arrival is below the high-water mark; nothing advances.
            return;
        }

        if let Some(prev) = self.previous_id {
            if id > prev.saturating_add(1) {
                let now = Instant::now();
                let first_missing = prev + 1;
                let gap_len = (id - first_missing) as u64;

                // Only the newest `max_tracked` IDs can survive eviction,
                // so a pathologically wide jump never inserts more than
                // that; everything older is lost up front.
                let start = if gap_len > self.max_tracked as u64 {
                    let lost = gap_len - self.max_tracked as u64;
                    warn!(
                        from = first_missing,
                        to = id - 1,
                        lost,
                        max_tracked = self.max_tracked,
                        "Gap wider than the tracking cap; oldest IDs are permanently skipped"
                    );
                    metrics::record_gaps_lost(lost);
                    id - self.max_tracked as i64
                } else {
                    first_missing
                };

                for gap_id in start..id {
                    self.missing.entry(gap_id).or_insert(now);
                    if self.missing.len() > self.max_tracked {
                        // Evict the smallest (oldest) ID. That event will
                        // never be retried.
                        if let Some((&lost, _)) = self.missing.iter().next() {
                            self.missing.remove(&lost);
                            warn!(
                                event_id = lost,
                                max_tracked = self.max_tracked,
                                "Gap tracker full, dropping oldest gap; event is permanently skipped"
                            );
                            metrics::record_gaps_lost(1);
                        }
                    }
                }

                debug!(
                    from = first_missing,
                    to = id - 1,
                    count = gap_len,
                    "Detected gap in event sequence"
                );
                metrics::record_gaps_detected(gap_len);
            }
        }

        self.set_previous_id(id);
        metrics::set_tracked_gaps(self.missing.len());
    }

    /// Re-query aged gaps against the log.
    ///
    /// Gaps past the age threshold are looked up: found events are returned
    /// for processing; events still absent past the hard ceiling are
    /// dropped with a data-loss warning. Younger gaps are left alone to
    /// give in-flight producer transactions time to commit.
    ///
    /// A returned event's gap stays tracked until the caller confirms the
    /// event was applied via [`resolve`](GapTracker::resolve). Closing it
    /// here would lose the event for good if its handler failed, since the
    /// durable position is already past it.
    pub async fn fill_gaps(&mut self, store: &EventStore) -> Result<Vec<EventLogEntry>> {
        if self.missing.is_empty() {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let due: Vec<i64> = self
            .missing
            .iter()
            .filter(|(_, first_seen)| now.duration_since(**first_seen) >= self.age_threshold)
            .map(|(&id, _)| id)
            .collect();

        let mut recovered = Vec::new();
        for id in due {
            match store.find_event(id).await? {
                Some(entry) => {
                    debug!(event_id = id, "Recovered late event for tracked gap");
                    recovered.push(entry);
                }
                None => {
                    let Some(&first_seen) = self.missing.get(&id) else {
                        continue;
                    };
                    if now.duration_since(first_seen) >= self.hard_ceiling {
                        self.missing.remove(&id);
                        warn!(
                            event_id = id,
                            ceiling_secs = self.hard_ceiling.as_secs(),
                            "Gap never materialized within ceiling, dropping; \
                             possible data loss if the event existed"
                        );
                        metrics::record_gaps_lost(1);
                    }
                }
            }
        }

        metrics::set_tracked_gaps(self.missing.len());
        Ok(recovered)
    }

    /// Close a gap whose recovered event was successfully applied.
    ///
    /// Returns `false` if the ID was not tracked. A gap left unresolved
    /// (handler failure) is re-queried on the next sweep, so the recovered
    /// event is redelivered instead of lost.
    pub fn resolve(&mut self, id: i64) -> bool {
        let closed = self.missing.remove(&id).is_some();
        if closed {
            metrics::record_gap_filled();
            metrics::set_tracked_gaps(self.missing.len());
        }
        closed
    }

    /// Currently tracked missing IDs, ascending.
    pub fn missing_ids(&self) -> Vec<i64> {
        self.missing.keys().copied().collect()
    }

    pub fn gap_count(&self) -> usize {
        self.missing.len()
    }

    pub fn previous_id(&self) -> Option<i64> {
        self.previous_id
    }
}
