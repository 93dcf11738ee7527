use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in u64; a clock set before the
/// epoch reads as 0.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
