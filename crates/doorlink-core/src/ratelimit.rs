// ── Device wakeup rate limiter ──
//
// The vendor bans accounts that wake devices too often. Every code path that
// requests an on-device status refresh must `check` first and `register`
// right after the wakeup succeeds. Keyed by access token; entries are
// never evicted.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::error::CoreError;

/// Minimum spacing between two wakeups on the same token (26 minutes).
pub const WAKEUP_INTERVAL: Duration = Duration::from_secs(1560);

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_wakeup: DashMap<String, Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_interval(WAKEUP_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_wakeup: DashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fail with [`CoreError::RateLimited`] if `token` woke a device too recently.
    ///
    /// Unseen tokens always pass. Never mutates state.
    pub fn check(&self, token: &str) -> Result<(), CoreError> {
        let Some(last) = self.last_wakeup.get(token).map(|entry| *entry.value()) else {
            return Ok(());
        };
        let next_allowed = last + self.interval;
        let now = Instant::now();
        if now < next_allowed {
            let retry_after = next_allowed - now;
            warn!(
                retry_after_secs = retry_after.as_secs(),
                "device wakeup rate limited"
            );
            return Err(CoreError::RateLimited {
                next_allowed,
                retry_after,
            });
        }
        Ok(())
    }

    /// Record that `token` just woke a device.
    pub fn register(&self, token: &str) {
        self.last_wakeup.insert(token.to_owned(), Instant::now());
    }
}
