// ── Collaborator seams ──
//
// The stream and reconciler talk to the vendor through these traits so
// tests can swap in in-memory fakes. `ApiBackend` is the production
// implementation over `doorlink_api::RestClient`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use doorlink_api::{LockOperation, PushHandle, RestClient};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::CoreError;

/// REST operations the reconciliation core needs.
pub trait ActivityBackend: Send + Sync + 'static {
    /// Access token for API calls. Also keys the wakeup rate limiter.
    fn access_token(&self) -> &SecretString;

    /// Raw activity-log records for a house, newest first.
    fn fetch_house_activities(
        &self,
        house_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Value>, CoreError>> + Send;

    /// Ask a device to wake up and report its state over push.
    fn wake_device(&self, device_id: &str) -> impl Future<Output = Result<(), CoreError>> + Send;
}

/// Whether realtime push is currently delivering.
pub trait PushConnection: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
}

// ── ApiBackend ──────────────────────────────────────────────────────

pub struct ApiBackend {
    client: RestClient,
    token: SecretString,
    hyper_bridge: bool,
}

impl std::fmt::Debug for ApiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiBackend")
            .field("base_url", &self.client.base_url().as_str())
            .field("token", &"[REDACTED]")
            .field("hyper_bridge", &self.hyper_bridge)
            .finish()
    }
}

impl ApiBackend {
    pub fn new(client: RestClient, token: SecretString) -> Self {
        Self {
            client,
            token,
            hyper_bridge: false,
        }
    }

    /// Request persistent bridge connections on wakeup.
    pub fn with_hyper_bridge(mut self, hyper_bridge: bool) -> Self {
        self.hyper_bridge = hyper_bridge;
        self
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }

    /// Run a remote lock operation and return the vendor's lock result.
    pub async fn operate(&self, lock_id: &str, operation: LockOperation) -> Result<Value, CoreError> {
        Ok(self
            .client
            .remote_operate(self.token.expose_secret(), lock_id, operation)
            .await?)
    }
}

impl ActivityBackend for ApiBackend {
    fn access_token(&self) -> &SecretString {
        &self.token
    }

    async fn fetch_house_activities(&self, house_id: &str, limit: usize) -> Result<Vec<Value>, CoreError> {
        self.client
            .house_activities(self.token.expose_secret(), house_id, limit)
            .await
            .map_err(|e| CoreError::fetch(house_id, e))
    }

    async fn wake_device(&self, device_id: &str) -> Result<(), CoreError> {
        Ok(self
            .client
            .status_async(self.token.expose_secret(), device_id, self.hyper_bridge)
            .await?)
    }
}

// ── PushConnection impls ────────────────────────────────────────────

impl PushConnection for PushHandle {
    fn is_connected(&self) -> bool {
        PushHandle::is_connected(self)
    }
}

impl PushConnection for watch::Receiver<bool> {
    fn is_connected(&self) -> bool {
        *self.borrow()
    }
}

impl PushConnection for AtomicBool {
    fn is_connected(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: PushConnection + ?Sized> PushConnection for Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
