// ── Core error types ──
//
// Errors surfaced by the reconciliation layer. Transport failures from
// doorlink-api are folded into `Fetch`/`Api` so the scheduler can treat
// every failed poll the same way.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Polling ──────────────────────────────────────────────────────
    /// A house activity fetch failed (network, auth, vendor 4xx/5xx).
    #[error("Activity fetch for house {house_id} failed: {message}")]
    Fetch { house_id: String, message: String },

    /// Device wakeups are rate limited; retrying early risks a vendor ban.
    #[error("Rate limited: next wakeup allowed in {} minutes", .retry_after.as_secs().div_ceil(60))]
    RateLimited {
        next_allowed: Instant,
        retry_after: Duration,
    },

    // ── Invariant violations ─────────────────────────────────────────
    /// An activity was applied to the detail of a different device.
    #[error("Activity for device {actual} applied to device {expected}")]
    DeviceMismatch { expected: String, actual: String },

    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wrap any error as a fetch failure for `house_id`.
    pub fn fetch(house_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Fetch {
            house_id: house_id.to_owned(),
            message: err.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<doorlink_api::Error> for CoreError {
    fn from(err: doorlink_api::Error) -> Self {
        match err {
            doorlink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            doorlink_api::Error::Api {
                status, message, ..
            } => CoreError::Api {
                message,
                status: Some(status),
            },
            other => CoreError::Api {
                message: other.to_string(),
                status: None,
            },
        }
    }
}
