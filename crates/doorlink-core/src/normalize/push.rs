// Push message normalization (Socket.IO and hosted pub/sub share a format).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::Display;

use super::{Header, assemble, parse_timestamp};
use crate::model::action::{
    ACTION_BRIDGE_OFFLINE, ACTION_BRIDGE_ONLINE, ACTION_DOORBELL_BUTTON_PUSHED,
    ACTION_DOORBELL_IMAGE_CAPTURE, ACTION_DOORBELL_MOTION_DETECTED,
};
use crate::model::{Activity, DoorStatus, LockStatus, Source};
use crate::users::UserDirectory;

const BRIDGE_OFFLINE_ERROR: &str = "ERRNO_BRIDGE_OFFLINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    Lock,
    Doorbell,
}

/// The device a push message was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub device_id: String,
    pub house_id: String,
    pub device_name: Option<String>,
    pub kind: DeviceKind,
}

impl DeviceRef {
    pub fn lock(device_id: impl Into<String>, house_id: impl Into<String>) -> Self {
        Self::new(DeviceKind::Lock, device_id, house_id)
    }

    pub fn doorbell(device_id: impl Into<String>, house_id: impl Into<String>) -> Self {
        Self::new(DeviceKind::Doorbell, device_id, house_id)
    }

    fn new(kind: DeviceKind, device_id: impl Into<String>, house_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            house_id: house_id.into(),
            device_name: None,
            kind,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }
}

/// Activities described by one push message.
///
/// A lock message can yield both a lock and a door activity. A pure status
/// echo (`info.action == "status"` that neither failed nor errored) yields
/// nothing at all.
pub fn activities_from_push(
    device: &DeviceRef,
    date_time: DateTime<Utc>,
    message: &Value,
    source: Source,
    users: &UserDirectory,
) -> Vec<Activity> {
    match device.kind {
        DeviceKind::Lock => lock_activities(device, date_time, message, source, users),
        DeviceKind::Doorbell => doorbell_activities(device, date_time, message, source, users),
    }
}

fn header(device: &DeviceRef, source: Source, time: DateTime<Utc>) -> Header {
    Header {
        source,
        activity_id: None,
        house_id: Some(device.house_id.clone()),
        device_id: device.device_id.clone(),
        device_name: device.device_name.clone(),
        device_type: Some(device.kind.to_string()),
        time,
    }
}

fn lock_activities(
    device: &DeviceRef,
    date_time: DateTime<Utc>,
    message: &Value,
    source: Source,
    users: &UserDirectory,
) -> Vec<Activity> {
    let mut info = object(message.get("info"));
    if message.get("remoteEvent").is_some() {
        info.insert("remote".into(), Value::Bool(true));
    }
    let start = info
        .get("context")
        .and_then(|c| c.get("startDate"))
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or(date_time);
    let is_status_echo = info.get("action").and_then(Value::as_str) == Some("status");

    let mut record = json!({ "info": info });
    if let Some(user_id) = message.get("callingUserID").and_then(Value::as_str) {
        record["callingUser"] = json!({ "UserID": user_id });
    }

    let status = message.get("status").and_then(Value::as_str);
    let error = message.get("error").filter(|e| !e.is_null());
    let failed = message.get("result").and_then(Value::as_str) == Some("failed");

    let lock_action = match status {
        Some(ACTION_BRIDGE_ONLINE) => Some(ACTION_BRIDGE_ONLINE),
        Some(ACTION_BRIDGE_OFFLINE) => Some(ACTION_BRIDGE_OFFLINE),
        _ if error.is_some_and(is_bridge_offline_error) => Some(ACTION_BRIDGE_OFFLINE),
        _ if is_status_echo && error.is_none() && !failed => return Vec::new(),
        Some(status) => LockStatus::from_vendor(status).action(),
        None => None,
    };
    let door_action = message
        .get("doorState")
        .and_then(Value::as_str)
        .and_then(|state| DoorStatus::from_vendor(Some(state)).action());

    [lock_action, door_action]
        .into_iter()
        .flatten()
        .filter_map(|action| assemble(header(device, source, start), action, &record, users))
        .collect()
}

fn doorbell_activities(
    device: &DeviceRef,
    date_time: DateTime<Utc>,
    message: &Value,
    source: Source,
    users: &UserDirectory,
) -> Vec<Activity> {
    let Some(status) = message.get("status").and_then(Value::as_str) else {
        return Vec::new();
    };
    if ![
        ACTION_DOORBELL_MOTION_DETECTED,
        ACTION_DOORBELL_IMAGE_CAPTURE,
        ACTION_DOORBELL_BUTTON_PUSHED,
    ]
    .contains(&status)
    {
        return Vec::new();
    }

    let mut info = object(message.get("data"));
    let result = info.get("result").cloned().unwrap_or_else(|| json!({}));
    info.entry("image").or_insert(result);
    let millis = Value::from(date_time.timestamp_millis());
    info.entry("started").or_insert_with(|| millis.clone());
    info.entry("ended").or_insert(millis);

    let record = json!({ "info": info });
    assemble(header(device, source, date_time), status, &record, users)
        .into_iter()
        .collect()
}

fn is_bridge_offline_error(error: &Value) -> bool {
    error.get("restCode").and_then(Value::as_i64)
        == Some(doorlink_api::error::BRIDGE_OFFLINE_REST_CODE)
        || error.get("name").and_then(Value::as_str) == Some(BRIDGE_OFFLINE_ERROR)
}

fn object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
