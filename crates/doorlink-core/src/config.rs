// ── Runtime scheduling configuration ──
//
// Timing knobs for the activity stream. Built by the embedding application
// and handed in; core never reads config files.

use std::time::Duration;

/// Tuning for [`ActivityStream`](crate::ActivityStream).
///
/// The defaults match the vendor cloud's observed behavior: its activity
/// log lags push by a few seconds, and a freshly started client should not
/// poll more than once per house until its first minute is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Period of the fallback refresh that runs while anyone is subscribed.
    pub activity_update_interval: Duration,
    /// Minimum spacing between two polls of the same house.
    pub debounce_cooldown: Duration,
    /// Window after setup during which triggers collapse to a single poll.
    pub initial_resync: Duration,
    /// Delay before the first poll of a fresh burst.
    pub update_soon: Duration,
    /// Activity records requested per poll once caught up.
    pub stream_fetch_limit: usize,
    /// Activity records requested by the very first poll.
    pub catch_up_fetch_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            activity_update_interval: Duration::from_secs(10),
            debounce_cooldown: Duration::from_secs(4),
            initial_resync: Duration::from_secs(60),
            update_soon: Duration::from_secs(3),
            stream_fetch_limit: 10,
            catch_up_fetch_limit: 2500,
        }
    }
}
