//! Small shared utilities.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix time in whole seconds.
///
/// Session records, leases and idempotency keys all carry second-resolution
/// timestamps; sub-second precision is not needed for any of them.
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Returns the current unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
