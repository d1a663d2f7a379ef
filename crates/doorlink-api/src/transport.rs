// Shared transport configuration for building reqwest::Client instances.
//
// The REST client and the push subscription call share timeout and
// user-agent settings through this module.

use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::Error;

const DEFAULT_USER_AGENT: &str = "August/2024.1.0 (doorlink)";

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` with the given default headers.
    ///
    /// Used by [`RestClient`](crate::RestClient) to inject the API key and
    /// branding headers on every request.
    pub fn build_client_with_headers(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(Error::Transport)
    }
}
