//! Wall-clock timestamps for wire-level send times.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic_enough() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
        // sanity: we are well past 2020
        assert!(a > 1_577_836_800_000_000);
    }
}
