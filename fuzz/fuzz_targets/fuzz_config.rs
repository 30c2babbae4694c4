//! Fuzz target for configuration parsing.
//!
//! Arbitrary bytes must never panic the JSON config path, and any config
//! that does parse must yield usable durations from the fallback parsers.

#![no_main]

use libfuzzer_sys::fuzz_target;
use log_cursor::CursorConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = serde_json::from_slice::<CursorConfig>(data) {
        // The humantime fields fall back to defaults on garbage strings.
        let _ = config.poll.interval_duration();
        let _ = config.poll.standby_backoff_duration();
        let _ = config.lease.ttl_duration();
        let _ = config.gaps.age_threshold_duration();
        let _ = config.gaps.hard_ceiling_duration();
        let _ = config.failure.max_error_duration_value();
    }
});
