//! Wall-clock helpers used for task timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Returns 0 if the system clock is set
/// before the epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Milliseconds elapsed since `since_ms`, saturating at zero.
#[must_use]
pub fn elapsed_ms(since_ms: u128) -> u128 {
    now_ms().saturating_sub(since_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_never_negative() {
        let future = now_ms() + 60_000;
        assert_eq!(elapsed_ms(future), 0);
    }
}
