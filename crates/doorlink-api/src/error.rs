use thiserror::Error;

/// Vendor error code the cloud returns when a lock's bridge is unreachable.
pub const BRIDGE_OFFLINE_REST_CODE: i64 = 98;

/// Top-level error type for the `doorlink-api` crate.
///
/// Covers every failure mode of the REST and push surfaces.
/// `doorlink-core` maps these into reconciliation-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Access token rejected (expired, revoked, or never valid).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Rate limited by the vendor. Includes retry-after in seconds.
    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Vendor API ──────────────────────────────────────────────────
    /// Non-success response from the REST API.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// Vendor `restCode`, when the body carried one.
        rest_code: Option<i64>,
    },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if the access token needs refreshing.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            Self::RateLimited { .. } | Self::WebSocketConnect(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the vendor reported the lock's bridge as offline.
    pub fn is_bridge_offline(&self) -> bool {
        matches!(
            self,
            Self::Api {
                rest_code: Some(BRIDGE_OFFLINE_REST_CODE),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_offline_is_detected_from_rest_code() {
        let err = Error::Api {
            status: 422,
            message: "bridge offline".into(),
            rest_code: Some(98),
        };
        assert!(err.is_bridge_offline());
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = Error::Api {
            status: 503,
            message: "unavailable".into(),
            rest_code: None,
        };
        assert!(err.is_transient());
        assert!(!err.is_bridge_offline());
    }

    #[test]
    fn authentication_is_auth_expired() {
        let err = Error::Authentication {
            message: "token expired".into(),
        };
        assert!(err.is_auth_expired());
        assert!(!err.is_transient());
    }
}
