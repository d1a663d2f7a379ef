// doorlink-api: vendor collaborators for the smart-lock cloud.
//
// REST client for house activity logs and remote lock operations, plus the
// Socket.IO push transport. Reconciliation of the two lives in doorlink-core.

pub mod client;
pub mod error;
pub mod transport;
pub mod websocket;

pub use client::{Brand, ClientConfig, LockOperation, RestClient, WebSocketSubscription};
pub use error::Error;
pub use transport::TransportConfig;
pub use websocket::{PushHandle, PushMessage, ReconnectConfig};
