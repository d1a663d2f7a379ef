//! Socket.IO push stream with auto-reconnect.
//!
//! Speaks just enough Engine.IO v4 over a plain WebSocket to receive the
//! vendor's `data` events, and streams them through a
//! [`tokio::sync::broadcast`] channel. Reconnection uses exponential backoff
//! with jitter. The connection state is published on a [`watch`] channel so
//! the scheduler can skip REST catch-up polls while push is live.
//!
//! # Example
//!
//! ```rust,ignore
//! use doorlink_api::websocket::{PushHandle, ReconnectConfig, socket_url};
//! use tokio_util::sync::CancellationToken;
//!
//! let url = socket_url(&subscription.subscriber_id)?;
//! let handle = PushHandle::connect(url, headers, ReconnectConfig::default(), CancellationToken::new());
//! let mut rx = handle.subscribe();
//!
//! while let Ok(msg) = rx.recv().await {
//!     println!("{:?}: {}", msg.device_id, msg.payload);
//! }
//!
//! handle.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Broadcast channel capacity ───────────────────────────────────────

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

const DEFAULT_SOCKET_HOST: &str = "wss://websocket.aaecosystem.com/socket.io/";

/// Socket.IO event name the vendor uses for device updates.
const DATA_EVENT: &str = "data";

/// Build the Engine.IO WebSocket URL for a registered subscriber.
pub fn socket_url(subscriber_id: &str) -> Result<Url, Error> {
    let mut url = Url::parse(DEFAULT_SOCKET_HOST)?;
    url.query_pairs_mut()
        .append_pair("subscriberID", subscriber_id)
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

// ── PushMessage ──────────────────────────────────────────────────────

/// One `data` event from the push service.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// The `lockID` field, when the event names a lock.
    pub device_id: Option<String>,
    /// Local receipt time. The vendor payload carries no reliable clock.
    pub received_at: DateTime<Utc>,
    /// The event body as sent.
    pub payload: Value,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── PushHandle ───────────────────────────────────────────────────────

/// Handle to a running push stream.
///
/// Call [`shutdown`](Self::shutdown) to tear down the background task.
pub struct PushHandle {
    message_rx: broadcast::Receiver<Arc<PushMessage>>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl PushHandle {
    /// Spawn the connection loop. Must be called inside a tokio runtime.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background. `headers` are sent on every upgrade request (access
    /// token, api key).
    pub fn connect(
        url: Url,
        headers: Vec<(String, String)>,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (message_tx, message_rx) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            ws_loop(url, headers, message_tx, connected_tx, reconnect, task_cancel).await;
        });

        Self {
            message_rx,
            connected,
            cancel,
        }
    }

    /// Get a new broadcast receiver for push messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushMessage>> {
        self.message_rx.resubscribe()
    }

    /// Whether the Socket.IO namespace is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch channel for connection state changes.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

async fn ws_loop(
    url: Url,
    headers: Vec<(String, String)>,
    message_tx: broadcast::Sender<Arc<PushMessage>>,
    connected_tx: watch::Sender<bool>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_read(&url, &headers, &message_tx, &connected_tx, &cancel) => result,
        };
        connected_tx.send_replace(false);

        match result {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::info!("push socket disconnected cleanly, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "push socket error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(
                            max_retries = max,
                            "push reconnection limit reached, giving up"
                        );
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &reconnect);
                tracing::info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        }
    }

    connected_tx.send_replace(false);
    tracing::debug!("push socket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn connect_and_read(
    url: &Url,
    headers: &[(String, String)],
    message_tx: &broadcast::Sender<Arc<PushMessage>>,
    connected_tx: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(host = url.host_str().unwrap_or(""), "connecting push socket");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    for (name, value) in headers {
        request = request.with_header(name.as_str(), value.as_str());
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => match parse_packet(&text) {
                Packet::Open => {
                    tracing::debug!("engine.io session open, joining namespace");
                    send_text(&mut write, "40").await?;
                }
                Packet::Connect => {
                    tracing::info!("push socket connected");
                    connected_tx.send_replace(true);
                }
                Packet::Ping => send_text(&mut write, "3").await?,
                Packet::Event(body) => broadcast_event(body, message_tx),
                Packet::Disconnect | Packet::Close => {
                    tracing::info!("server closed the push session");
                    return Ok(());
                }
                Packet::ConnectError(reason) => {
                    return Err(Error::WebSocketConnect(format!(
                        "namespace connect refused: {reason}"
                    )));
                }
                Packet::Other => tracing::trace!(frame = %text.as_str(), "ignored engine.io frame"),
            },
            Some(Ok(tungstenite::Message::Close(frame))) => {
                if let Some(cf) = frame {
                    return Err(Error::WebSocketClosed {
                        code: cf.code.into(),
                        reason: cf.reason.to_string(),
                    });
                }
                return Ok(());
            }
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            None => {
                tracing::info!("push socket stream ended");
                return Ok(());
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn send_text<S>(write: &mut S, text: &'static str) -> Result<(), Error>
where
    S: futures_util::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    write
        .send(tungstenite::Message::text(text))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

// ── Packet parsing ───────────────────────────────────────────────────

/// The Engine.IO / Socket.IO frames this client cares about.
#[derive(Debug, PartialEq, Eq)]
enum Packet<'a> {
    Open,
    Close,
    Ping,
    Connect,
    Disconnect,
    ConnectError(&'a str),
    /// Socket.IO event; the JSON array body.
    Event(&'a str),
    Other,
}

fn parse_packet(text: &str) -> Packet<'_> {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Packet::Open,
        Some('1') => Packet::Close,
        Some('2') => Packet::Ping,
        Some('4') => {
            let rest = chars.as_str();
            match rest.chars().next() {
                Some('0') => Packet::Connect,
                Some('1') => Packet::Disconnect,
                // event packets may carry a namespace or ack id before the array
                Some('2') => rest.find('[').map_or(Packet::Other, |i| Packet::Event(&rest[i..])),
                Some('4') => Packet::ConnectError(&rest[1..]),
                _ => Packet::Other,
            }
        }
        _ => Packet::Other,
    }
}

/// Decode a `["data", {...}]` event body and broadcast it.
fn broadcast_event(body: &str, message_tx: &broadcast::Sender<Arc<PushMessage>>) {
    let Some(message) = message_from_event(body, Utc::now()) else {
        return;
    };
    // No receivers just means nobody is listening yet.
    let _ = message_tx.send(Arc::new(message));
}

fn message_from_event(body: &str, received_at: DateTime<Utc>) -> Option<PushMessage> {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse socket.io event");
            return None;
        }
    };

    let Value::Array(mut parts) = parsed else {
        tracing::debug!("socket.io event body is not an array");
        return None;
    };
    if parts.first().and_then(Value::as_str) != Some(DATA_EVENT) || parts.len() < 2 {
        tracing::trace!("ignoring non-data socket.io event");
        return None;
    }

    let payload = parts.swap_remove(1);
    let device_id = payload
        .get("lockID")
        .and_then(Value::as_str)
        .map(String::from);
    Some(PushMessage {
        device_id,
        received_at,
        payload,
    })
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 +- 0.25)`
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic jitter seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_carries_subscriber_and_protocol() {
        let url = socket_url("sub-123").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/socket.io/");
        let query = url.query().unwrap();
        assert!(query.contains("subscriberID=sub-123"));
        assert!(query.contains("EIO=4"));
        assert!(query.contains("transport=websocket"));
    }

    #[test]
    fn backoff_increases_then_caps() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        let d0 = calculate_backoff(0, &config);
        let d2 = calculate_backoff(2, &config);
        let d10 = calculate_backoff(10, &config);

        assert!(d2 > d0, "d2 ({d2:?}) should be greater than d0 ({d0:?})");
        assert!(
            d10 <= Duration::from_millis(12_500),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn parses_engine_io_control_frames() {
        assert_eq!(parse_packet(r#"0{"sid":"abc","pingInterval":25000}"#), Packet::Open);
        assert_eq!(parse_packet("2"), Packet::Ping);
        assert_eq!(parse_packet("1"), Packet::Close);
        assert_eq!(parse_packet(r#"40{"sid":"xyz"}"#), Packet::Connect);
        assert_eq!(parse_packet("41"), Packet::Disconnect);
        assert_eq!(
            parse_packet(r#"44{"message":"unauthorized"}"#),
            Packet::ConnectError(r#"{"message":"unauthorized"}"#)
        );
        assert_eq!(parse_packet("6"), Packet::Other);
        assert_eq!(parse_packet(""), Packet::Other);
    }

    #[test]
    fn parses_event_with_namespace_prefix() {
        assert_eq!(
            parse_packet(r#"42/locks,["data",{}]"#),
            Packet::Event(r#"["data",{}]"#)
        );
        assert_eq!(parse_packet(r#"42["data",{}]"#), Packet::Event(r#"["data",{}]"#));
    }

    #[test]
    fn data_event_becomes_push_message() {
        let now = Utc::now();
        let body = r#"["data",{"lockID":"LOCK1","lockAction":"lock","doorState":"closed"}]"#;

        let msg = message_from_event(body, now).unwrap();
        assert_eq!(msg.device_id.as_deref(), Some("LOCK1"));
        assert_eq!(msg.received_at, now);
        assert_eq!(msg.payload["lockAction"], "lock");
    }

    #[test]
    fn other_events_and_garbage_are_skipped() {
        let now = Utc::now();
        assert!(message_from_event(r#"["hello",{"lockID":"L"}]"#, now).is_none());
        assert!(message_from_event(r#"["data"]"#, now).is_none());
        assert!(message_from_event("not json", now).is_none());
        assert!(message_from_event(r#"{"data":1}"#, now).is_none());
    }

    #[test]
    fn broadcast_event_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(4);
        broadcast_event(r#"["data",{"lockID":"L2","status":"kAugLockState_Locked"}]"#, &tx);

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.device_id.as_deref(), Some("L2"));
    }
}
