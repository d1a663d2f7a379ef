// REST client for the lock vendor cloud
//
// Thin wrapper around `reqwest::Client`: URL construction, the vendor's
// header set, and status-code mapping. No retries and no login flow; the
// caller owns the access token and its refresh.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

const HEADER_ACCESS_TOKEN: &str = "x-august-access-token";
const HEADER_API_KEY: &str = "x-august-api-key";
const HEADER_BRANDING: &str = "x-august-branding";
const HEADER_COUNTRY: &str = "x-august-country";
const HEADER_ACCEPT_VERSION: &str = "accept-version";

const DEFAULT_ACCEPT_VERSION: &str = "0.0.1";
const ACTIVITIES_ACCEPT_VERSION: &str = "4.0.0";
const REMOTE_OPERATE_VERSION: &str = "2.3.1";

// ── Brand ────────────────────────────────────────────────────────────

/// Which vendor cloud to talk to. Both speak the same API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Brand {
    #[default]
    August,
    YaleAccess,
    YaleHome,
}

impl Brand {
    pub fn base_url(self) -> &'static str {
        match self {
            Self::August | Self::YaleAccess => "https://api-production.august.com",
            Self::YaleHome => "https://api.aaecosystem.com",
        }
    }

    /// Value of the branding header.
    pub fn branding(self) -> &'static str {
        match self {
            Self::August => "august",
            Self::YaleAccess => "yale_access",
            Self::YaleHome => "yale_home",
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────

/// Everything needed to build a [`RestClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub brand: Brand,
    pub api_key: SecretString,
    /// Overrides the brand's base URL (staging, tests).
    pub base_url: Option<Url>,
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn new(brand: Brand, api_key: SecretString) -> Self {
        Self {
            brand,
            api_key,
            base_url: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Response of `POST /websocket/subscribers`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSubscription {
    #[serde(rename = "subscriberID")]
    pub subscriber_id: String,
}

/// Remote lock operations accepted by `/remoteoperate/{lock_id}/{op}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Lock,
    Unlock,
    Unlatch,
}

impl LockOperation {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Unlatch => "unlatch",
        }
    }
}

// ── RestClient ───────────────────────────────────────────────────────

/// Raw HTTP client for the vendor REST API.
///
/// Methods return the vendor JSON untouched; turning it into activities is
/// the normalizer's job in `doorlink-core`.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    /// Build a client with the vendor's default header set.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let api_key = reqwest::header::HeaderValue::from_str(config.api_key.expose_secret())
            .map_err(|_| Error::Authentication {
                message: "API key is not a valid header value".into(),
            })?;
        headers.insert(HEADER_API_KEY, api_key);
        headers.insert(
            HEADER_BRANDING,
            reqwest::header::HeaderValue::from_static(config.brand.branding()),
        );
        headers.insert(HEADER_COUNTRY, reqwest::header::HeaderValue::from_static("US"));

        let http = config.transport.build_client_with_headers(headers)?;
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None => Url::parse(config.brand.base_url())?,
        };
        Ok(Self { http, base_url })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// Fetch the most recent `limit` activity records for a house.
    ///
    /// The vendor sometimes wraps the list as `{"events": [...]}`; both
    /// shapes come back as a flat list.
    pub async fn house_activities(
        &self,
        token: &str,
        house_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>, Error> {
        let url = self.url(&format!("houses/{house_id}/activities"))?;
        debug!(house_id, limit, "GET {}", url);

        let resp = self
            .http
            .get(url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_ACCEPT_VERSION, ACTIVITIES_ACCEPT_VERSION)
            .query(&[("limit", limit)])
            .send()
            .await?;

        match parse_response(resp).await? {
            Value::Array(records) => Ok(records),
            Value::Object(mut map) => match map.remove("events") {
                Some(Value::Array(records)) => Ok(records),
                _ => Err(Error::Deserialization {
                    message: "activity response has no events list".into(),
                    body: Value::Object(map).to_string(),
                }),
            },
            other => Err(Error::Deserialization {
                message: "unexpected activity response shape".into(),
                body: other.to_string(),
            }),
        }
    }

    /// Run a synchronous remote operation and return the lock result JSON.
    pub async fn remote_operate(
        &self,
        token: &str,
        lock_id: &str,
        operation: LockOperation,
    ) -> Result<Value, Error> {
        let url = self.url(&format!(
            "remoteoperate/{lock_id}/{}",
            operation.path_segment()
        ))?;
        debug!(lock_id, "PUT {}", url);

        let resp = self
            .http
            .put(url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_ACCEPT_VERSION, DEFAULT_ACCEPT_VERSION)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Ask the lock to wake up and report its status over push.
    ///
    /// Every call wakes the device; the vendor bans accounts that do this
    /// too often, so callers gate it behind a rate limiter.
    pub async fn status_async(
        &self,
        token: &str,
        lock_id: &str,
        hyper_bridge: bool,
    ) -> Result<(), Error> {
        let url = self.url(&format!("remoteoperate/{lock_id}/status"))?;
        debug!(lock_id, hyper_bridge, "PUT {}", url);

        let mut query = vec![
            ("v", REMOTE_OPERATE_VERSION),
            ("type", "async"),
            ("intent", "wakeup"),
        ];
        if hyper_bridge {
            query.push(("connection", "persistent"));
        }

        let resp = self
            .http
            .put(url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_ACCEPT_VERSION, DEFAULT_ACCEPT_VERSION)
            .query(&query)
            .send()
            .await?;
        check_status(resp).await.map(drop)
    }

    /// The account's own user record (`/users/me`).
    pub async fn get_user(&self, token: &str) -> Result<Value, Error> {
        let url = self.url("users/me")?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_ACCEPT_VERSION, DEFAULT_ACCEPT_VERSION)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Register a WebSocket push subscriber for lock events.
    pub async fn websocket_subscription(
        &self,
        token: &str,
    ) -> Result<WebSocketSubscription, Error> {
        let url = self.url("websocket/subscribers")?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_ACCEPT_VERSION, DEFAULT_ACCEPT_VERSION)
            .json(&serde_json::json!({ "scopes": ["lock"] }))
            .send()
            .await?;

        let body = parse_response(resp).await?;
        serde_json::from_value(body.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: body.to_string(),
        })
    }
}

// ── Response handling ────────────────────────────────────────────────

/// Map non-success statuses into [`Error`] variants.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            message: format!("HTTP {status}: verify the brand and access token"),
        });
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        return Err(Error::RateLimited { retry_after_secs });
    }

    let body = resp.text().await.unwrap_or_default();
    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    let rest_code = parsed
        .as_ref()
        .and_then(|v| v.get("restCode").or_else(|| v.pointer("/error/restCode")))
        .and_then(Value::as_i64);
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").and_then(Value::as_str))
        .map_or_else(|| body.chars().take(200).collect(), String::from);

    Err(Error::Api {
        status: status.as_u16(),
        message,
        rest_code,
    })
}

async fn parse_response(resp: reqwest::Response) -> Result<Value, Error> {
    let resp = check_status(resp).await?;
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}
