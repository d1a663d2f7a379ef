// ── Event normalizer ──
//
// Turns vendor JSON (activity-log records, push messages, lock operation
// responses) into `Activity` values. Never fails: anything unrecognized or
// malformed is logged at debug and dropped, since the vendor adds new
// action tokens over time.

mod push;

pub use push::{DeviceKind, DeviceRef, activities_from_push};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::model::action::{self, ActionKind};
use crate::model::{
    Activity, ActivityDetails, DoorStatus, DoorbellCall, DoorbellImage, LockOperation, Source,
};
use crate::users::UserDirectory;

/// Header fields shared by every activity variant.
struct Header {
    source: Source,
    activity_id: Option<String>,
    house_id: Option<String>,
    device_id: String,
    device_name: Option<String>,
    device_type: Option<String>,
    time: DateTime<Utc>,
}

// ── Entry points ────────────────────────────────────────────────────

/// Normalize one REST activity-log record.
pub fn activity_from_log(record: &Value, users: &UserDirectory) -> Option<Activity> {
    let Some(action) = record.get("action").and_then(Value::as_str) else {
        debug!("activity record without action, skipping");
        return None;
    };
    let Some(device_id) = record.get("deviceID").and_then(Value::as_str) else {
        debug!(action, "activity record without deviceID, skipping");
        return None;
    };
    let Some(time) = record
        .get("dateTime")
        .or_else(|| record.get("timestamp"))
        .and_then(epoch_millis)
    else {
        debug!(action, device_id, "activity record without timestamp, skipping");
        return None;
    };

    let header = Header {
        source: Source::Log,
        activity_id: text(record.pointer("/entities/activity")),
        house_id: text(record.pointer("/entities/house")),
        device_id: device_id.to_owned(),
        device_name: text(record.get("deviceName")),
        device_type: text(record.get("deviceType")),
        time,
    };
    assemble(header, action, record, users)
}

/// Normalize a batch of log records, dropping the ones that do not parse.
pub fn activities_from_log(records: &[Value], users: &UserDirectory) -> Vec<Activity> {
    records
        .iter()
        .filter_map(|record| activity_from_log(record, users))
        .collect()
}

/// Activities implied by a synchronous lock/unlock/unlatch response.
///
/// Yields the lock activity, followed by a door activity when the response
/// carries a usable door state.
pub fn activities_from_lock_result(result: &Value, users: &UserDirectory) -> Vec<Activity> {
    let info = result.get("info");
    let lock_id = info.and_then(|i| i.get("lockID")).and_then(Value::as_str);
    let action = info.and_then(|i| i.get("action")).and_then(Value::as_str);
    let start = info
        .and_then(|i| i.get("startTime"))
        .and_then(Value::as_str)
        .and_then(parse_timestamp);

    let (Some(lock_id), Some(action), Some(start)) = (lock_id, action, start) else {
        debug!("lock result without lockID, action or startTime, skipping");
        return Vec::new();
    };

    let header = |time| Header {
        source: Source::LockOperate,
        activity_id: None,
        house_id: None,
        device_id: lock_id.to_owned(),
        device_name: None,
        device_type: Some("lock".to_owned()),
        time,
    };

    let mut activities = Vec::with_capacity(2);
    activities.extend(assemble(header(start), action, &Value::Null, users));

    let door = DoorStatus::from_vendor(result.get("doorState").and_then(Value::as_str));
    if let Some(door_action) = door.action() {
        activities.extend(assemble(header(start), door_action, &Value::Null, users));
    }
    activities
}

// ── Variant assembly ────────────────────────────────────────────────

fn assemble(header: Header, action: &str, record: &Value, users: &UserDirectory) -> Option<Activity> {
    let Some(kind) = action::action_kind(action) else {
        debug!(action, device_id = %header.device_id, "unknown activity action, skipping");
        return None;
    };

    let mut end_time = header.time;
    let mut start_time = header.time;
    let details = match kind {
        ActionKind::LockOperation => {
            ActivityDetails::LockOperation(lock_operation(action, record, users))
        }
        ActionKind::DoorOperation => ActivityDetails::DoorOperation,
        ActionKind::BridgeOperation => ActivityDetails::BridgeOperation,
        ActionKind::DoorbellMotion => {
            ActivityDetails::DoorbellMotion(doorbell_image(record, header.time))
        }
        ActionKind::DoorbellImageCapture => {
            ActivityDetails::DoorbellImageCapture(doorbell_image(record, header.time))
        }
        ActionKind::DoorbellDing | ActionKind::DoorbellView => {
            let info = record.get("info");
            let epoch = |key| info.and_then(|i| i.get(key)).and_then(epoch_millis);
            start_time = epoch("started").unwrap_or(header.time);
            end_time = epoch("ended").unwrap_or(header.time);
            let call = DoorbellCall {
                image_url: info
                    .and_then(|i| url_field(i.get("image")))
                    .or_else(|| text(info.and_then(|i| i.get("attachment")))),
            };
            if kind == ActionKind::DoorbellDing {
                ActivityDetails::DoorbellDing(call)
            } else {
                ActivityDetails::DoorbellView(call)
            }
        }
    };

    Some(Activity {
        source: header.source,
        activity_id: header.activity_id,
        house_id: header.house_id,
        device_id: header.device_id,
        device_name: header.device_name,
        device_type: header.device_type,
        action: action.to_owned(),
        start_time,
        end_time,
        details,
    })
}

/// Resolve operator name, flags and avatar for a lock operation.
///
/// Name comes from the payload's calling user, then the user directory,
/// then the fixed table for operations with no human behind them.
fn lock_operation(action: &str, record: &Value, users: &UserDirectory) -> LockOperation {
    let calling_user = record
        .get("callingUser")
        .or_else(|| record.get("user"))
        .filter(|u| u.is_object());
    let info = record.get("info");
    let user_id = calling_user
        .and_then(|u| u.get("UserID"))
        .and_then(Value::as_str);
    let flag = |key: &str, default: bool| {
        info.and_then(|i| i.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(default)
    };
    let cached = user_id.and_then(|id| users.get_user(id));

    let mut first_name = text(calling_user.and_then(|u| u.get("FirstName")));
    let mut last_name = text(calling_user.and_then(|u| u.get("LastName")));
    if first_name.is_none() && last_name.is_none() {
        if let Some(user) = &cached {
            first_name.clone_from(&user.first_name);
            last_name.clone_from(&user.last_name);
        }
    }
    if first_name.is_none() && last_name.is_none() {
        if let Some((first, last)) = action::fallback_operator(action) {
            first_name = Some(first.to_owned());
            last_name = Some(last.to_owned());
        }
    }
    let operated_by = match (first_name, last_name) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(name), None) | (None, Some(name)) => Some(name),
        (None, None) => None,
    };

    let image_info = calling_user
        .and_then(|u| u.get("imageInfo"))
        .filter(|i| i.is_object())
        .or(calling_user);
    let mut image_url = image_info.and_then(|i| url_field(i.get("original")));
    let mut thumbnail_url = image_info.and_then(|i| url_field(i.get("thumbnail")));
    if image_url.is_none() && thumbnail_url.is_none() {
        if let Some(user) = &cached {
            image_url.clone_from(&user.image_url);
            thumbnail_url.clone_from(&user.thumbnail_url);
        }
    }
    if thumbnail_url.is_none() {
        thumbnail_url = text(record.get("icon"));
    }
    if thumbnail_url.is_none() {
        thumbnail_url.clone_from(&image_url);
    }
    if image_url.is_none() {
        image_url.clone_from(&thumbnail_url);
    }

    LockOperation {
        operated_by,
        operated_remote: flag("remote", action::is_remote_action(action)),
        operated_keypad: flag("keypad", action::is_keypad_action(action)),
        operated_manual: flag("manual", action::is_manual_action(action)),
        operated_tag: flag("tag", action::is_tag_action(action)),
        operated_autorelock: user_id == Some(action::AUTORELOCK_USER_ID)
            || action::is_autorelock_action(action),
        operator_image_url: image_url,
        operator_thumbnail_url: thumbnail_url,
    }
}

fn doorbell_image(record: &Value, fallback: DateTime<Utc>) -> DoorbellImage {
    let info = record.get("info");
    let image = info
        .and_then(|i| i.get("image"))
        .filter(|i| i.is_object());

    let image_url = text(image.and_then(|i| i.get("secure_url")))
        .or_else(|| text(info.and_then(|i| i.get("attachment"))))
        .or_else(|| text(record.get("attachment")));
    let image_created_at = image.map(|i| {
        i.get("created_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(fallback)
    });

    DoorbellImage {
        image_url,
        image_created_at,
        content_token: text(info.and_then(|i| i.get("contentToken"))),
    }
}

// ── Field helpers ───────────────────────────────────────────────────

/// Non-empty string field.
fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Image reference: a bare URL or an object with `secure_url`.
fn url_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(_) => text(value),
        Value::Object(map) => text(map.get("secure_url")),
        _ => None,
    }
}

/// Epoch milliseconds, as a number or numeric string.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub(crate) fn epoch_millis(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = value.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    let ms = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !ms.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis(ms.round() as i64)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::model::ActivityType;

    fn log_record(action: &str) -> Value {
        json!({
            "entities": { "activity": "act-1", "house": "house-1" },
            "dateTime": 1_582_007_218_000_i64,
            "action": action,
            "deviceID": "LOCK1",
            "deviceName": "Front Door",
            "deviceType": "lock"
        })
    }

    #[test]
    fn log_record_header() {
        let users = UserDirectory::new();
        let activity = activity_from_log(&log_record("doorclosed"), &users).unwrap();

        assert_eq!(activity.source, Source::Log);
        assert_eq!(activity.activity_id.as_deref(), Some("act-1"));
        assert_eq!(activity.house_id.as_deref(), Some("house-1"));
        assert_eq!(activity.device_name.as_deref(), Some("Front Door"));
        assert_eq!(activity.activity_type(), ActivityType::DoorOperation);
        assert_eq!(activity.start_time.timestamp_millis(), 1_582_007_218_000);
        assert_eq!(activity.start_time, activity.end_time);
    }

    #[test]
    fn timestamp_field_is_a_fallback_for_date_time() {
        let users = UserDirectory::new();
        let record = json!({ "action": "lock", "deviceID": "L", "timestamp": "1582007218000" });
        let activity = activity_from_log(&record, &users).unwrap();
        assert_eq!(activity.start_time.timestamp_millis(), 1_582_007_218_000);
    }

    #[test]
    fn unknown_or_malformed_records_are_dropped() {
        let users = UserDirectory::new();
        assert!(activity_from_log(&log_record("doorbell_reboot"), &users).is_none());
        assert!(activity_from_log(&json!({ "deviceID": "L" }), &users).is_none());
        assert!(activity_from_log(&json!({ "action": "lock", "deviceID": "L" }), &users).is_none());
        assert!(activity_from_log(&json!("garbage"), &users).is_none());

        let batch = [log_record("lock"), log_record("bogus"), log_record("unlock")];
        assert_eq!(activities_from_log(&batch, &users).len(), 2);
    }

    #[test]
    fn rf_unlock_without_known_user_uses_fallback_name() {
        let users = UserDirectory::new();
        let mut record = log_record("rf_unlock");
        record["callingUser"] = json!({ "UserID": "not-cached" });

        let activity = activity_from_log(&record, &users).unwrap();
        let op = activity.lock_operation().unwrap();
        assert_eq!(op.operated_by.as_deref(), Some("Radio Frequency Unlock"));
        assert!(op.operated_tag);
        assert!(!op.operated_remote);
        assert_eq!(activity.activity_type(), ActivityType::LockOperation);
    }

    #[test]
    fn plain_unlock_without_user_has_no_operator() {
        let users = UserDirectory::new();
        let mut record = log_record("unlock");
        record["callingUser"] = json!({ "UserID": "manualunlock" });

        let activity = activity_from_log(&record, &users).unwrap();
        assert_eq!(activity.lock_operation().unwrap().operated_by, None);
        assert_eq!(
            activity.activity_type(),
            ActivityType::LockOperationWithoutOperator
        );
    }

    #[test]
    fn calling_user_name_and_images_win() {
        let users = UserDirectory::new();
        users.cache_user("u1", &json!({ "FirstName": "cached", "LastName": "user" }));
        let mut record = log_record("remote_unlock");
        record["callingUser"] = json!({
            "UserID": "u1",
            "FirstName": "Jane",
            "LastName": "Doe",
            "imageInfo": {
                "original": "https://img/orig.jpg",
                "thumbnail": { "secure_url": "https://img/thumb.jpg" }
            }
        });

        let activity = activity_from_log(&record, &users).unwrap();
        let op = activity.lock_operation().unwrap();
        assert_eq!(op.operated_by.as_deref(), Some("Jane Doe"));
        assert!(op.operated_remote);
        assert_eq!(op.operator_image_url.as_deref(), Some("https://img/orig.jpg"));
        assert_eq!(op.operator_thumbnail_url.as_deref(), Some("https://img/thumb.jpg"));
    }

    #[test]
    fn user_directory_fills_name_and_images() {
        let users = UserDirectory::new();
        users.cache_user(
            "u2",
            &json!({
                "FirstName": "bob",
                "LastName": "smith",
                "imageInfo": { "original": { "secure_url": "https://img/bob.png" } }
            }),
        );
        let mut record = log_record("pin_unlock");
        record["callingUser"] = json!({ "UserID": "u2" });

        let activity = activity_from_log(&record, &users).unwrap();
        let op = activity.lock_operation().unwrap();
        assert_eq!(op.operated_by.as_deref(), Some("bob smith"));
        assert!(op.operated_keypad);
        // only the original was cached; the thumbnail mirrors it
        assert_eq!(op.operator_thumbnail_url.as_deref(), Some("https://img/bob.png"));
    }

    #[test]
    fn icon_fills_missing_thumbnail() {
        let users = UserDirectory::new();
        let mut record = log_record("manual_lock");
        record["icon"] = json!("https://img/manual.png");

        let op = activity_from_log(&record, &users)
            .unwrap()
            .lock_operation()
            .cloned()
            .unwrap();
        assert_eq!(op.operated_by.as_deref(), Some("Manual Lock"));
        assert!(op.operated_manual);
        assert_eq!(op.operator_thumbnail_url.as_deref(), Some("https://img/manual.png"));
        assert_eq!(op.operator_image_url.as_deref(), Some("https://img/manual.png"));
    }

    #[test]
    fn info_flags_override_action_sets() {
        let users = UserDirectory::new();
        let mut record = log_record("unlock");
        record["info"] = json!({ "remote": true, "keypad": true });
        record["callingUser"] = json!({ "UserID": "automaticrelock" });

        let activity = activity_from_log(&record, &users).unwrap();
        let op = activity.lock_operation().unwrap();
        assert!(op.operated_remote);
        assert!(op.operated_keypad);
        assert!(op.operated_autorelock);
    }

    #[test]
    fn doorbell_ding_uses_started_and_ended() {
        let users = UserDirectory::new();
        let record = json!({
            "action": "doorbell_call_missed",
            "deviceID": "DB1",
            "dateTime": 1_000_i64,
            "info": {
                "started": 5_000_i64,
                "ended": 9_000_i64,
                "image": { "secure_url": "https://img/ding.jpg" }
            }
        });

        let activity = activity_from_log(&record, &users).unwrap();
        assert_eq!(activity.activity_type(), ActivityType::DoorbellDing);
        assert_eq!(activity.start_time.timestamp_millis(), 5_000);
        assert_eq!(activity.end_time.timestamp_millis(), 9_000);
        assert_eq!(
            activity.details,
            ActivityDetails::DoorbellDing(DoorbellCall {
                image_url: Some("https://img/ding.jpg".into())
            })
        );
    }

    #[test]
    fn doorbell_motion_image_and_created_at() {
        let users = UserDirectory::new();
        let record = json!({
            "action": "doorbell_motion_detected",
            "deviceID": "DB1",
            "dateTime": 1_000_i64,
            "info": {
                "contentToken": "tok",
                "image": {
                    "secure_url": "https://img/motion.jpg",
                    "created_at": "2020-02-18T06:26:58Z"
                }
            }
        });

        let activity = activity_from_log(&record, &users).unwrap();
        let ActivityDetails::DoorbellMotion(image) = &activity.details else {
            panic!("expected motion, got {:?}", activity.details);
        };
        assert_eq!(image.image_url.as_deref(), Some("https://img/motion.jpg"));
        assert_eq!(
            image.image_created_at,
            parse_timestamp("2020-02-18T06:26:58Z")
        );
        assert_eq!(image.content_token.as_deref(), Some("tok"));
    }

    #[test]
    fn motion_without_image_has_no_created_at() {
        let users = UserDirectory::new();
        let record = json!({
            "action": "doorbell_motion_detected",
            "deviceID": "DB1",
            "dateTime": 1_000_i64,
            "attachment": "https://img/attachment.jpg"
        });

        let activity = activity_from_log(&record, &users).unwrap();
        let ActivityDetails::DoorbellMotion(image) = &activity.details else {
            panic!("expected motion");
        };
        assert_eq!(image.image_url.as_deref(), Some("https://img/attachment.jpg"));
        assert_eq!(image.image_created_at, None);
    }

    #[test]
    fn lock_result_yields_lock_then_door() {
        let users = UserDirectory::new();
        let result = json!({
            "status": "kAugLockState_Locked",
            "doorState": "kAugLockDoorState_Closed",
            "info": {
                "action": "lock",
                "lockID": "LOCK1",
                "startTime": "2017-12-10T04:48:30.272Z"
            }
        });

        let activities = activities_from_lock_result(&result, &users);
        let actions: Vec<_> = activities.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec!["lock", "doorclosed"]);
        assert!(activities.iter().all(|a| a.source == Source::LockOperate));
        assert_eq!(activities[0].device_id, "LOCK1");
        assert_eq!(
            activities[0].start_time,
            parse_timestamp("2017-12-10T04:48:30.272Z").unwrap()
        );
    }

    #[test]
    fn lock_result_without_door_sensor() {
        let users = UserDirectory::new();
        let result = json!({
            "doorState": "kAugDoorState_Init",
            "info": { "action": "unlatch", "lockID": "L", "startTime": "2024-05-01T00:00:00Z" }
        });

        let activities = activities_from_lock_result(&result, &users);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].action, "unlatch");
        assert!(activities_from_lock_result(&json!({}), &users).is_empty());
    }
}
