//! Fuzz target for gap tracking.
//!
//! Feeds arbitrary event ID sequences through `GapTracker::check` and
//! verifies it never panics and never exceeds its tracking cap, even on
//! absurd jumps or out-of-order input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use log_cursor::GapTracker;
use std::time::Duration;

fuzz_target!(|ids: Vec<i64>| {
    let cap = 256;
    let mut tracker = GapTracker::new(Duration::from_secs(600), Duration::from_secs(600), cap);

    for id in ids {
        tracker.check(id);
        assert!(tracker.gap_count() <= cap);
    }

    // Every tracked gap sits below the high-water mark.
    if let Some(prev) = tracker.previous_id() {
        for missing in tracker.missing_ids() {
            assert!(missing < prev);
        }
    }
});
