//! Wall-clock helper

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
///
/// All persisted timestamps (state TTLs, token expirations) are unix seconds,
/// so a single helper keeps every component on the same clock.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
