//! Sync interval scheduling.
//!
//! Services that change often sync often; quiet services back off
//! exponentially by doubling the time since their last sync, capped at eight
//! hours.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Upper bound on the interval between two syncs of one service.
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

/// Compute the interval until the next sync of a service.
///
/// An error-free first sync or changed pass schedules the next pass after
/// `min_interval`. Otherwise the interval doubles the time elapsed since the
/// last sync, clamped to `min_interval..=MAX_SYNC_INTERVAL` — an errored pass
/// backs off like an unchanged one, so a persistently failing service is
/// polled less and less instead of retried at the minimum.
pub fn calc_sync_interval(
    now: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    min_interval: Duration,
    repos_changed: bool,
    errored: bool,
) -> Duration {
    let min_interval = min_interval.min(MAX_SYNC_INTERVAL);

    if !errored && (last_sync.is_none() || repos_changed) {
        return min_interval;
    }

    let elapsed = last_sync
        .map(|last_sync| (now - last_sync).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(Duration::ZERO);
    (elapsed * 2).clamp(min_interval, MAX_SYNC_INTERVAL)
}
