// ── Device detail cache ──
//
// Last known lock and doorbell state per device. Activities are applied
// here under the same newer-wins rules the resolver uses, and a REST detail
// refresh can keep the push-maintained fields when push is live.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::model::{Activity, ActivityDetails, DoorStatus, LockStatus};
use crate::normalize::{DeviceKind, DeviceRef, parse_timestamp};

fn check_device(expected: &str, activity: &Activity) -> Result<(), CoreError> {
    if activity.device_id == expected {
        Ok(())
    } else {
        Err(CoreError::DeviceMismatch {
            expected: expected.to_owned(),
            actual: activity.device_id.clone(),
        })
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(String::from)
}

// ── Lock ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDetail {
    pub device_id: String,
    pub house_id: String,
    pub device_name: Option<String>,
    pub lock_status: LockStatus,
    pub lock_status_datetime: Option<DateTime<Utc>>,
    pub door_state: DoorStatus,
    pub door_state_datetime: Option<DateTime<Utc>>,
    /// `None` when the lock has no bridge.
    pub bridge_online: Option<bool>,
}

/// Fields push keeps fresher than the REST detail endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAttrs {
    pub lock_status: LockStatus,
    pub lock_status_datetime: Option<DateTime<Utc>>,
    pub door_state: DoorStatus,
    pub door_state_datetime: Option<DateTime<Utc>>,
}

impl LockDetail {
    pub fn new(device_id: impl Into<String>, house_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            house_id: house_id.into(),
            device_name: None,
            lock_status: LockStatus::Unknown,
            lock_status_datetime: None,
            door_state: DoorStatus::Unknown,
            door_state_datetime: None,
            bridge_online: None,
        }
    }

    /// Parse a vendor lock detail record (`LockID`, `HouseID`, `LockStatus`, `Bridge`).
    pub fn from_record(raw: &Value) -> Option<Self> {
        let device_id = raw.get("LockID").and_then(Value::as_str)?;
        let house_id = raw.get("HouseID").and_then(Value::as_str)?;
        let mut detail = Self::new(device_id, house_id);
        detail.device_name = text(raw.get("LockName"));

        if let Some(status) = raw.get("LockStatus") {
            detail.lock_status = status
                .get("status")
                .and_then(Value::as_str)
                .map_or(LockStatus::Unknown, LockStatus::from_vendor);
            detail.door_state =
                DoorStatus::from_vendor(status.get("doorState").and_then(Value::as_str));
            detail.lock_status_datetime = status
                .get("dateTime")
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            detail.door_state_datetime = detail.lock_status_datetime;
        }

        if let Some(bridge) = raw.get("Bridge") {
            let current = bridge.pointer("/status/current").and_then(Value::as_str);
            let operative = bridge.get("operative").and_then(Value::as_bool) == Some(true);
            detail.bridge_online = Some(match current {
                Some(current) => current == "online",
                None => operative,
            });
        }
        Some(detail)
    }

    pub fn device_ref(&self) -> DeviceRef {
        DeviceRef {
            device_id: self.device_id.clone(),
            house_id: self.house_id.clone(),
            device_name: self.device_name.clone(),
            kind: DeviceKind::Lock,
        }
    }

    /// Apply a lock, door or bridge activity. Returns whether anything changed.
    pub fn apply_activity(&mut self, activity: &Activity) -> Result<bool, CoreError> {
        check_device(&self.device_id, activity)?;
        let at = activity.end_time;

        match &activity.details {
            ActivityDetails::LockOperation(_) => {
                let Some(status) = activity.lock_status() else {
                    return Ok(false);
                };
                if let Some(current) = self.lock_status_datetime {
                    if current > at || (current == at && !self.lock_status.is_moving()) {
                        return Ok(false);
                    }
                }
                self.lock_status = status;
                self.lock_status_datetime = Some(at);
            }
            ActivityDetails::DoorOperation => {
                let Some(state) = activity.door_status() else {
                    return Ok(false);
                };
                if self.door_state_datetime.is_some_and(|current| current >= at) {
                    return Ok(false);
                }
                self.door_state = state;
                self.door_state_datetime = Some(at);
            }
            ActivityDetails::BridgeOperation => {
                let Some(online) = activity.bridge_online() else {
                    return Ok(false);
                };
                self.bridge_online = Some(online);
            }
            _ => return Ok(false),
        }
        trace!(device_id = %self.device_id, action = %activity.action, "lock detail updated");
        Ok(true)
    }

    pub fn live_attrs(&self) -> LiveAttrs {
        LiveAttrs {
            lock_status: self.lock_status,
            lock_status_datetime: self.lock_status_datetime,
            door_state: self.door_state,
            door_state_datetime: self.door_state_datetime,
        }
    }

    pub fn restore_live_attrs(&mut self, attrs: LiveAttrs) {
        self.lock_status = attrs.lock_status;
        self.lock_status_datetime = attrs.lock_status_datetime;
        self.door_state = attrs.door_state;
        self.door_state_datetime = attrs.door_state_datetime;
    }
}

// ── Doorbell ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorbellDetail {
    pub device_id: String,
    pub house_id: String,
    pub device_name: Option<String>,
    pub image_url: Option<String>,
    pub image_created_at: Option<DateTime<Utc>>,
    pub content_token: Option<String>,
}

impl DoorbellDetail {
    pub fn new(device_id: impl Into<String>, house_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            house_id: house_id.into(),
            device_name: None,
            image_url: None,
            image_created_at: None,
            content_token: None,
        }
    }

    /// Parse a vendor doorbell detail record (`DoorbellID`, `HouseID`, `recentImage`).
    pub fn from_record(raw: &Value) -> Option<Self> {
        let device_id = raw.get("DoorbellID").and_then(Value::as_str)?;
        let house_id = raw.get("HouseID").and_then(Value::as_str)?;
        let mut detail = Self::new(device_id, house_id);
        detail.device_name = text(raw.get("name"));
        if let Some(image) = raw.get("recentImage") {
            detail.image_url = text(image.get("secure_url"));
            detail.image_created_at = image
                .get("created_at")
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
        }
        detail.content_token = text(raw.get("contentToken"));
        Some(detail)
    }

    pub fn device_ref(&self) -> DeviceRef {
        DeviceRef {
            device_id: self.device_id.clone(),
            house_id: self.house_id.clone(),
            device_name: self.device_name.clone(),
            kind: DeviceKind::Doorbell,
        }
    }

    /// Take the image of a newer motion or image-capture activity.
    pub fn apply_activity(&mut self, activity: &Activity) -> Result<bool, CoreError> {
        check_device(&self.device_id, activity)?;
        let image = match &activity.details {
            ActivityDetails::DoorbellMotion(image) | ActivityDetails::DoorbellImageCapture(image) => {
                image
            }
            _ => return Ok(false),
        };
        let Some(created_at) = image.image_created_at else {
            return Ok(false);
        };
        if self.image_created_at.is_some_and(|current| current >= created_at) {
            return Ok(false);
        }

        self.image_url.clone_from(&image.image_url);
        self.image_created_at = Some(created_at);
        if image.content_token.is_some() {
            self.content_token.clone_from(&image.content_token);
        }
        trace!(device_id = %self.device_id, "doorbell image updated");
        Ok(true)
    }
}

// ── Cache ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDetail {
    Lock(LockDetail),
    Doorbell(DoorbellDetail),
}

impl DeviceDetail {
    pub fn device_id(&self) -> &str {
        match self {
            Self::Lock(lock) => &lock.device_id,
            Self::Doorbell(doorbell) => &doorbell.device_id,
        }
    }

    pub fn device_ref(&self) -> DeviceRef {
        match self {
            Self::Lock(lock) => lock.device_ref(),
            Self::Doorbell(doorbell) => doorbell.device_ref(),
        }
    }

    pub fn apply_activity(&mut self, activity: &Activity) -> Result<bool, CoreError> {
        match self {
            Self::Lock(lock) => lock.apply_activity(activity),
            Self::Doorbell(doorbell) => doorbell.apply_activity(activity),
        }
    }
}

impl From<LockDetail> for DeviceDetail {
    fn from(detail: LockDetail) -> Self {
        Self::Lock(detail)
    }
}

impl From<DoorbellDetail> for DeviceDetail {
    fn from(detail: DoorbellDetail) -> Self {
        Self::Doorbell(detail)
    }
}

/// Device details keyed by device id.
#[derive(Debug, Default)]
pub struct DeviceDetailCache {
    details: DashMap<String, DeviceDetail>,
}

impl DeviceDetailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, detail: impl Into<DeviceDetail>) {
        let detail = detail.into();
        self.details.insert(detail.device_id().to_owned(), detail);
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceDetail> {
        self.details.get(device_id).map(|d| d.value().clone())
    }

    pub fn lock(&self, device_id: &str) -> Option<LockDetail> {
        match self.get(device_id)? {
            DeviceDetail::Lock(lock) => Some(lock),
            DeviceDetail::Doorbell(_) => None,
        }
    }

    pub fn doorbell(&self, device_id: &str) -> Option<DoorbellDetail> {
        match self.get(device_id)? {
            DeviceDetail::Doorbell(doorbell) => Some(doorbell),
            DeviceDetail::Lock(_) => None,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.details.contains_key(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.details.iter().map(|d| d.key().clone()).collect()
    }

    /// Apply one activity to the detail of the device it names.
    pub fn apply_activity(&self, activity: &Activity) -> Result<bool, CoreError> {
        let mut detail =
            self.details
                .get_mut(&activity.device_id)
                .ok_or_else(|| CoreError::UnknownDevice {
                    device_id: activity.device_id.clone(),
                })?;
        detail.apply_activity(activity)
    }

    /// Replace a detail with a fresh REST copy.
    ///
    /// With push connected the cached lock and door state is newer than
    /// what the detail endpoint serves, so it is carried over.
    pub fn refresh(&self, fresh: impl Into<DeviceDetail>, push_connected: bool) {
        let mut fresh = fresh.into();
        if push_connected {
            let cached = self.lock(fresh.device_id());
            if let (DeviceDetail::Lock(fresh_lock), Some(cached)) = (&mut fresh, cached) {
                debug!(device_id = %cached.device_id, "keeping push-maintained lock state");
                fresh_lock.restore_live_attrs(cached.live_attrs());
            }
        }
        self.insert(fresh);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::model::{DoorbellImage, LockOperation, Source};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn activity(device: &str, action: &str, secs: i64, details: ActivityDetails) -> Activity {
        Activity {
            source: Source::Log,
            activity_id: None,
            house_id: None,
            device_id: device.into(),
            device_name: None,
            device_type: None,
            action: action.into(),
            start_time: at(secs),
            end_time: at(secs),
            details,
        }
    }

    fn lock_op(action: &str, secs: i64) -> Activity {
        activity("L", action, secs, ActivityDetails::LockOperation(LockOperation::default()))
    }

    #[test]
    fn lock_status_follows_newer_activity() {
        let mut lock = LockDetail::new("L", "H");
        assert!(lock.apply_activity(&lock_op("lock", 10)).unwrap());
        assert_eq!(lock.lock_status, LockStatus::Locked);

        assert!(!lock.apply_activity(&lock_op("unlock", 5)).unwrap());
        assert!(!lock.apply_activity(&lock_op("unlock", 10)).unwrap());
        assert!(lock.apply_activity(&lock_op("unlock", 11)).unwrap());
        assert_eq!(lock.lock_status, LockStatus::Unlocked);
        assert_eq!(lock.lock_status_datetime, Some(at(11)));
    }

    #[test]
    fn terminal_replaces_moving_at_same_time() {
        let mut lock = LockDetail::new("L", "H");
        lock.apply_activity(&lock_op("unlocking", 10)).unwrap();
        assert_eq!(lock.lock_status, LockStatus::Unlocking);
        assert!(lock.apply_activity(&lock_op("unlock", 10)).unwrap());
        assert_eq!(lock.lock_status, LockStatus::Unlocked);
    }

    #[test]
    fn door_requires_strictly_newer() {
        let mut lock = LockDetail::new("L", "H");
        let open = activity("L", "dooropen", 10, ActivityDetails::DoorOperation);
        let closed = activity("L", "doorclosed", 10, ActivityDetails::DoorOperation);
        assert!(lock.apply_activity(&open).unwrap());
        assert!(!lock.apply_activity(&closed).unwrap());
        assert_eq!(lock.door_state, DoorStatus::Open);
    }

    #[test]
    fn bridge_activity_sets_online() {
        let mut lock = LockDetail::new("L", "H");
        let offline = activity("L", "associated_bridge_offline", 1, ActivityDetails::BridgeOperation);
        assert!(lock.apply_activity(&offline).unwrap());
        assert_eq!(lock.bridge_online, Some(false));
    }

    #[test]
    fn mismatched_device_is_an_error() {
        let mut lock = LockDetail::new("L", "H");
        let other = activity("X", "lock", 1, ActivityDetails::LockOperation(LockOperation::default()));
        match lock.apply_activity(&other) {
            Err(CoreError::DeviceMismatch { expected, actual }) => {
                assert_eq!((expected.as_str(), actual.as_str()), ("L", "X"));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn doorbell_takes_newer_image_only() {
        let mut doorbell = DoorbellDetail::new("D", "H");
        let image = |url: &str, secs: i64, token: Option<&str>| {
            activity(
                "D",
                "imagecapture",
                secs,
                ActivityDetails::DoorbellImageCapture(DoorbellImage {
                    image_url: Some(url.into()),
                    image_created_at: Some(at(secs)),
                    content_token: token.map(String::from),
                }),
            )
        };

        assert!(doorbell.apply_activity(&image("one", 10, Some("t1"))).unwrap());
        assert!(!doorbell.apply_activity(&image("old", 5, None)).unwrap());
        assert!(doorbell.apply_activity(&image("two", 20, None)).unwrap());
        assert_eq!(doorbell.image_url.as_deref(), Some("two"));
        assert_eq!(doorbell.content_token.as_deref(), Some("t1"));
    }

    #[test]
    fn records_parse() {
        let lock = LockDetail::from_record(&json!({
            "LockID": "L",
            "HouseID": "H",
            "LockName": "Front",
            "LockStatus": {
                "status": "locked",
                "doorState": "closed",
                "dateTime": "2024-01-01T00:00:10Z"
            },
            "Bridge": { "operative": true, "status": { "current": "offline" } }
        }))
        .unwrap();
        assert_eq!(lock.lock_status, LockStatus::Locked);
        assert_eq!(lock.door_state, DoorStatus::Closed);
        assert_eq!(lock.lock_status_datetime, Some(at(10)));
        assert_eq!(lock.bridge_online, Some(false));
        assert_eq!(lock.device_ref().kind, DeviceKind::Lock);

        let doorbell = DoorbellDetail::from_record(&json!({
            "DoorbellID": "D",
            "HouseID": "H",
            "recentImage": { "secure_url": "https://img", "created_at": "2024-01-01T00:00:00Z" }
        }))
        .unwrap();
        assert_eq!(doorbell.image_created_at, Some(at(0)));
        assert!(LockDetail::from_record(&json!({ "LockID": "L" })).is_none());
    }

    #[test]
    fn cache_routes_and_preserves_live_attrs() {
        let cache = DeviceDetailCache::new();
        cache.insert(LockDetail::new("L", "H"));
        assert!(cache.apply_activity(&lock_op("unlock", 30)).unwrap());
        assert!(matches!(
            cache.apply_activity(&activity("nope", "lock", 1, ActivityDetails::DoorOperation)),
            Err(CoreError::UnknownDevice { .. })
        ));

        let mut stale = LockDetail::new("L", "H");
        stale.lock_status = LockStatus::Locked;
        stale.lock_status_datetime = Some(at(1));
        stale.bridge_online = Some(true);

        cache.refresh(stale.clone(), true);
        let kept = cache.lock("L").unwrap();
        assert_eq!(kept.lock_status, LockStatus::Unlocked);
        assert_eq!(kept.bridge_online, Some(true));

        cache.refresh(stale, false);
        assert_eq!(cache.lock("L").unwrap().lock_status, LockStatus::Locked);
        assert!(cache.doorbell("L").is_none());
    }
}
