//! Monotonic elapsed-time clock.
//!
//! All engine timestamps are nanoseconds since process start, the same
//! "elapsed realtime" convention atom producers stamp their events with.

use once_cell::sync::Lazy;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed since the clock was first read.
pub fn elapsed_realtime_ns() -> i64 {
    i64::try_from(PROCESS_START.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

pub const NS_PER_MS: i64 = 1_000_000;
pub const NS_PER_SEC: i64 = 1_000_000_000;

pub fn ns_to_millis(ns: i64) -> i64 {
    ns / NS_PER_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = elapsed_realtime_ns();
        let b = elapsed_realtime_ns();
        assert!(b >= a);
        assert!(a >= 0);
    }
}
