// ── Push reconciler ──
//
// Entry point for realtime updates. Push messages are normalized, merged
// into the latest-activity table and the device detail cache, and turned
// into debounced activity-log refreshes so operator details catch up.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use doorlink_api::PushMessage;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ActivityBackend, PushConnection};
use crate::config::StreamConfig;
use crate::detail::{DeviceDetail, DeviceDetailCache, DoorbellDetail, LockDetail};
use crate::error::CoreError;
use crate::model::{Activity, Source};
use crate::normalize::{self, DeviceKind, DeviceRef};
use crate::ratelimit::RateLimiter;
use crate::stream::ActivityStream;
use crate::users::UserDirectory;

/// State shared with the rest of the client.
///
/// The rate limiter in particular should be one instance per process.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    pub users: Arc<UserDirectory>,
    pub details: Arc<DeviceDetailCache>,
    pub limiter: Arc<RateLimiter>,
}

/// Last `lockAction`/`doorState` pair seen over the WebSocket per device.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WebSocketState {
    lock_action: String,
    door_state: String,
}

/// Ties push delivery, the activity stream and the detail cache together.
pub struct Reconciler<B, P> {
    inner: Arc<ReconcilerInner<B, P>>,
}

impl<B, P> Clone for Reconciler<B, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ReconcilerInner<B, P> {
    stream: ActivityStream<B, P>,
    devices: DashMap<String, DeviceRef>,
    shared: SharedState,
    websocket_state: DashMap<String, WebSocketState>,
    bridge: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<B: ActivityBackend, P: PushConnection> Reconciler<B, P> {
    pub fn new(
        backend: Arc<B>,
        push: P,
        devices: impl IntoIterator<Item = DeviceRef>,
        shared: SharedState,
        config: StreamConfig,
    ) -> Self {
        let devices: DashMap<String, DeviceRef> = devices
            .into_iter()
            .map(|device| (device.device_id.clone(), device))
            .collect();

        let mut house_ids: Vec<String> = Vec::new();
        for device in &devices {
            ensure_detail(&shared.details, device.value());
            if !house_ids.contains(&device.house_id) {
                house_ids.push(device.house_id.clone());
            }
        }
        house_ids.sort();

        let stream = ActivityStream::new(
            backend,
            push,
            house_ids,
            Arc::clone(&shared.users),
            Arc::clone(&shared.details),
            config,
        );
        for device in &devices {
            stream.register_device(&device.device_id, &device.house_id);
        }

        Self {
            inner: Arc::new(ReconcilerInner {
                stream,
                devices,
                shared,
                websocket_state: DashMap::new(),
                bridge: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Run the initial activity catch-up.
    pub async fn setup(&self) {
        info!(devices = self.inner.devices.len(), "starting reconciler");
        self.inner.stream.setup().await;
    }

    /// Stop the activity stream and the push bridge. Idempotent.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.stream.stop();
        if let Some(handle) = self.inner.bridge().take() {
            handle.abort();
            debug!("push bridge stopped");
        }
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Track a device added after construction. Its house is polled on demand.
    pub fn register_device(&self, device: DeviceRef) {
        ensure_detail(&self.inner.shared.details, &device);
        self.inner
            .stream
            .register_device(&device.device_id, &device.house_id);
        self.inner.devices.insert(device.device_id.clone(), device);
    }

    /// Track a device from its REST detail, replacing any cached detail.
    pub fn register_detail(&self, detail: impl Into<DeviceDetail>) {
        let detail = detail.into();
        let device = detail.device_ref();
        self.inner
            .shared
            .details
            .refresh(detail, self.inner.stream.push_connected());
        self.inner
            .stream
            .register_device(&device.device_id, &device.house_id);
        self.inner.devices.insert(device.device_id.clone(), device);
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRef> {
        self.inner.devices.get(device_id).map(|d| d.value().clone())
    }

    pub fn lock_detail(&self, device_id: &str) -> Option<LockDetail> {
        self.inner.shared.details.lock(device_id)
    }

    pub fn doorbell_detail(&self, device_id: &str) -> Option<DoorbellDetail> {
        self.inner.shared.details.doorbell(device_id)
    }

    pub fn stream(&self) -> &ActivityStream<B, P> {
        &self.inner.stream
    }

    pub fn shared(&self) -> &SharedState {
        &self.inner.shared
    }

    // ── Push handling ────────────────────────────────────────────────

    /// Process one push message. Errors are logged, never returned.
    pub fn handle_push_message(
        &self,
        device_id: &str,
        date_time: DateTime<Utc>,
        message: &Value,
        source: Source,
    ) {
        if let Err(e) = self.try_handle_push_message(device_id, date_time, message, source) {
            error!(device_id, %date_time, %source, error = %e, "error processing push message");
        }
    }

    fn try_handle_push_message(
        &self,
        device_id: &str,
        date_time: DateTime<Utc>,
        message: &Value,
        source: Source,
    ) -> Result<(), CoreError> {
        debug!(%source, device_id, "push message received");

        if source == Source::WebSocket && self.is_unchanged_websocket_state(device_id, message) {
            debug!(device_id, "skipping unchanged websocket state");
            return Ok(());
        }
        let Some(device) = self.device(device_id) else {
            debug!(device_id, "push message for unknown device");
            return Ok(());
        };

        let activities = normalize::activities_from_push(
            &device,
            date_time,
            message,
            source,
            &self.inner.shared.users,
        );
        self.apply_activities(&activities)?;

        if activities.is_empty()
            || self
                .inner
                .stream
                .process_newer_device_activities(&activities)
                .is_empty()
        {
            return Ok(());
        }
        self.inner.stream.notify(&device.device_id);

        // status echoes never show up in the activity log, polling for them is wasted
        if let Some(activity) = activities.iter().find(|a| !a.is_status()) {
            debug!(device_id, action = %activity.action, "push activity triggers house refresh");
            self.inner.stream.on_house_refresh_request(&device.house_id);
        }
        Ok(())
    }

    fn is_unchanged_websocket_state(&self, device_id: &str, message: &Value) -> bool {
        let lock_action = message.get("lockAction");
        let door_state = message.get("doorState");
        if lock_action.is_none() && door_state.is_none() {
            return false;
        }
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_owned();
        let current = WebSocketState {
            lock_action: text(lock_action),
            door_state: text(door_state),
        };

        match self.inner.websocket_state.entry(device_id.to_owned()) {
            Entry::Occupied(last) if *last.get() == current => true,
            Entry::Occupied(mut last) => {
                last.insert(current);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(current);
                false
            }
        }
    }

    /// Feed a transport's broadcast stream into [`handle_push_message`](Self::handle_push_message).
    ///
    /// Replaces any bridge started earlier.
    pub fn spawn_push_bridge(&self, mut rx: broadcast::Receiver<Arc<PushMessage>>) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let reconciler = self.clone();
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => {
                            let Some(device_id) = msg.device_id.as_deref() else {
                                debug!("push message without device id");
                                continue;
                            };
                            reconciler.handle_push_message(
                                device_id,
                                msg.received_at,
                                &msg.payload,
                                Source::WebSocket,
                            );
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "push bridge lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => {
                            debug!("push channel closed");
                            break;
                        }
                    },
                }
            }
        });

        if let Some(previous) = self.inner.bridge().replace(handle) {
            previous.abort();
        }
    }

    // ── Device operations ────────────────────────────────────────────

    /// Wake a lock so it reports its state over push.
    ///
    /// Rate limited per access token; a rejection is final and must not be
    /// retried automatically.
    pub async fn request_status(&self, device_id: &str) -> Result<(), CoreError> {
        match self.device(device_id) {
            Some(device) if device.kind == DeviceKind::Lock => {}
            _ => {
                return Err(CoreError::UnknownDevice {
                    device_id: device_id.to_owned(),
                });
            }
        }
        let backend = self.inner.stream.backend();
        let token = backend.access_token().expose_secret();

        self.inner.shared.limiter.check(token)?;
        backend.wake_device(device_id).await?;
        self.inner.shared.limiter.register(token);
        debug!(device_id, "device wakeup requested");
        Ok(())
    }

    /// Apply the response of a synchronous lock, unlock or unlatch call.
    pub fn apply_lock_result(&self, device_id: &str, result: &Value) -> Result<Vec<Activity>, CoreError> {
        let activities = normalize::activities_from_lock_result(result, &self.inner.shared.users);
        if let Some(other) = activities.iter().find(|a| a.device_id != device_id) {
            return Err(CoreError::DeviceMismatch {
                expected: device_id.to_owned(),
                actual: other.device_id.clone(),
            });
        }
        self.apply_activities(&activities)?;
        for changed in self.inner.stream.process_newer_device_activities(&activities) {
            self.inner.stream.notify(&changed);
        }
        Ok(activities)
    }

    fn apply_activities(&self, activities: &[Activity]) -> Result<(), CoreError> {
        for activity in activities {
            self.inner.shared.details.apply_activity(activity)?;
        }
        Ok(())
    }
}

impl<B, P> ReconcilerInner<B, P> {
    fn bridge(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_detail(details: &DeviceDetailCache, device: &DeviceRef) {
    if details.contains(&device.device_id) {
        return;
    }
    let mut detail: DeviceDetail = match device.kind {
        DeviceKind::Lock => LockDetail::new(&device.device_id, &device.house_id).into(),
        DeviceKind::Doorbell => DoorbellDetail::new(&device.device_id, &device.house_id).into(),
    };
    match &mut detail {
        DeviceDetail::Lock(lock) => lock.device_name.clone_from(&device.device_name),
        DeviceDetail::Doorbell(doorbell) => doorbell.device_name.clone_from(&device.device_name),
    }
    details.insert(detail);
}
