//! Time-related utilities

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::activity::Timestamp;

/// Get the current system time in nanoseconds since UNIX epoch
pub fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_nanos() as Timestamp
}

/// Convert a duration in milliseconds to nanoseconds
pub fn ms_to_ns(ms: i64) -> i64 {
    ms * 1_000_000
}

/// Convert a nanosecond interval to whole milliseconds
pub fn ns_to_ms(ns: i64) -> i64 {
    ns / 1_000_000
}

/// Convert a `Duration` to a nanosecond interval
pub fn duration_ns(d: Duration) -> i64 {
    d.as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_nanos() {
        let ns = now_nanos();
        // After 2020
        assert!(ns > 1_600_000_000 * 1_000_000_000);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ms_to_ns(5), 5_000_000);
        assert_eq!(ns_to_ms(5_500_000), 5);
        assert_eq!(duration_ns(Duration::from_millis(2)), 2_000_000);
    }
}
