// ── Activity domain types ──
//
// One normalized record per notable device event, whether it came from the
// REST activity log, a push message, or a lock operation response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::action::{self, ActionState};
use super::status::{DoorStatus, LockStatus};

/// Where an activity was observed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// REST activity log.
    #[strum(serialize = "log")]
    Log,
    /// Hosted pub/sub push.
    #[strum(serialize = "pubnub")]
    PubNub,
    /// Socket.IO push.
    #[strum(serialize = "websocket")]
    WebSocket,
    /// Synthesized from a synchronous lock operation response.
    #[strum(serialize = "lock_operate")]
    LockOperate,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityType {
    DoorbellMotion,
    DoorbellDing,
    DoorbellView,
    DoorbellImageCapture,
    LockOperation,
    /// A lock operation nobody could be credited with.
    LockOperationWithoutOperator,
    DoorOperation,
    BridgeOperation,
}

/// Normalized activity: shared header plus a variant payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub source: Source,
    pub activity_id: Option<String>,
    pub house_id: Option<String>,
    pub device_id: String,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub action: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub details: ActivityDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityDetails {
    LockOperation(LockOperation),
    DoorOperation,
    BridgeOperation,
    DoorbellMotion(DoorbellImage),
    DoorbellImageCapture(DoorbellImage),
    DoorbellDing(DoorbellCall),
    DoorbellView(DoorbellCall),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockOperation {
    /// Display name of whoever operated the lock.
    pub operated_by: Option<String>,
    pub operated_remote: bool,
    pub operated_keypad: bool,
    pub operated_manual: bool,
    pub operated_tag: bool,
    pub operated_autorelock: bool,
    pub operator_image_url: Option<String>,
    pub operator_thumbnail_url: Option<String>,
}

/// Payload of motion and image-capture activities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DoorbellImage {
    pub image_url: Option<String>,
    pub image_created_at: Option<DateTime<Utc>>,
    pub content_token: Option<String>,
}

/// Payload of ding and view activities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DoorbellCall {
    pub image_url: Option<String>,
}

impl Activity {
    pub fn activity_type(&self) -> ActivityType {
        match &self.details {
            ActivityDetails::LockOperation(op) if op.operated_by.is_none() => {
                ActivityType::LockOperationWithoutOperator
            }
            ActivityDetails::LockOperation(_) => ActivityType::LockOperation,
            ActivityDetails::DoorOperation => ActivityType::DoorOperation,
            ActivityDetails::BridgeOperation => ActivityType::BridgeOperation,
            ActivityDetails::DoorbellMotion(_) => ActivityType::DoorbellMotion,
            ActivityDetails::DoorbellImageCapture(_) => ActivityType::DoorbellImageCapture,
            ActivityDetails::DoorbellDing(_) => ActivityType::DoorbellDing,
            ActivityDetails::DoorbellView(_) => ActivityType::DoorbellView,
        }
    }

    /// Status echoes only ever arrive over push; the REST log never records
    /// them, so polling after one is pointless.
    pub fn is_status(&self) -> bool {
        matches!(self.details, ActivityDetails::BridgeOperation)
    }

    /// Whether the action describes a bolt still in motion.
    pub fn is_moving(&self) -> bool {
        action::is_moving_action(&self.action)
    }

    pub fn lock_status(&self) -> Option<LockStatus> {
        match action::action_state(&self.action) {
            Some(ActionState::Lock(status)) => Some(status),
            _ => None,
        }
    }

    pub fn door_status(&self) -> Option<DoorStatus> {
        match action::action_state(&self.action) {
            Some(ActionState::Door(status)) => Some(status),
            _ => None,
        }
    }

    /// `true` for an activity reporting the bridge back online.
    pub fn bridge_online(&self) -> Option<bool> {
        match self.action.as_str() {
            action::ACTION_BRIDGE_ONLINE => Some(true),
            action::ACTION_BRIDGE_OFFLINE => Some(false),
            _ => None,
        }
    }

    pub fn lock_operation(&self) -> Option<&LockOperation> {
        match &self.details {
            ActivityDetails::LockOperation(op) => Some(op),
            _ => None,
        }
    }
}
