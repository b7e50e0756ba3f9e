//! Wall-clock sampling
//!
//! Share timestamps, peer freshness windows, vardiff intervals, and cache
//! expiry all key off whole-second Unix time read here.

use std::time::{SystemTime, UNIX_EPOCH};

/// Whole seconds since the Unix epoch.
///
/// A clock sitting before the epoch would turn every freshness window into
/// a huge negative span; clamp to zero and let the next sane reading take
/// over.
pub fn current_timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => since_epoch.as_secs(),
        Err(_) => {
            tracing::warn!("system clock reads earlier than the Unix epoch, clamping to zero");
            0
        }
    }
}
