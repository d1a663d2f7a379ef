// ── Lock and door status ──
//
// The vendor reports status as free-form strings drawn from a handful of
// fixed vocabularies. These sets are vendor-defined and must match
// byte-for-byte.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

const LOCKED: &[&str] = &["locked", "kAugLockState_Locked", "kAugLockState_SecureMode"];
const LOCKING: &[&str] = &["kAugLockState_Locking"];
const UNLATCHED: &[&str] = &["unlatched", "kAugLockState_Unlatched"];
const UNLATCHING: &[&str] = &["kAugLockState_Unlatching"];
const UNLOCKED: &[&str] = &["unlocked", "kAugLockState_Unlocked"];
const UNLOCKING: &[&str] = &["kAugLockState_Unlocking"];
const JAMMED: &[&str] = &[
    "kAugLockState_UnknownStaticPosition",
    "FAILED_BRIDGE_ERROR_LOCK_JAMMED",
];

const DOOR_CLOSED: &[&str] = &["closed", "kAugLockDoorState_Closed", "kAugDoorState_Closed"];
const DOOR_OPEN: &[&str] = &["open", "kAugLockDoorState_Open", "kAugDoorState_Open"];
const DOOR_DISABLED: &[&str] = &["init", "kAugDoorState_Init", ""];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockStatus {
    Locked,
    Unlocked,
    Locking,
    Unlocking,
    Unlatched,
    Unlatching,
    Jammed,
    Unknown,
}

impl LockStatus {
    /// Classify a raw vendor status string.
    pub fn from_vendor(status: &str) -> Self {
        if LOCKED.contains(&status) {
            Self::Locked
        } else if UNLATCHED.contains(&status) {
            Self::Unlatched
        } else if UNLOCKED.contains(&status) {
            Self::Unlocked
        } else if UNLATCHING.contains(&status) {
            Self::Unlatching
        } else if UNLOCKING.contains(&status) {
            Self::Unlocking
        } else if LOCKING.contains(&status) {
            Self::Locking
        } else if JAMMED.contains(&status) {
            Self::Jammed
        } else {
            Self::Unknown
        }
    }

    /// Transitional states: the bolt is still travelling.
    pub fn is_moving(self) -> bool {
        matches!(self, Self::Locking | Self::Unlocking | Self::Unlatching)
    }

    /// The action token a push message with this status stands for.
    pub fn action(self) -> Option<&'static str> {
        match self {
            Self::Locked => Some("lock"),
            Self::Unlocked => Some("unlock"),
            Self::Locking => Some("locking"),
            Self::Unlocking => Some("unlocking"),
            Self::Unlatched => Some("unlatch"),
            Self::Unlatching => Some("unlatching"),
            Self::Jammed => Some("jammed"),
            Self::Unknown => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DoorStatus {
    Open,
    Closed,
    /// Door sensor not installed or not calibrated.
    Disabled,
    Unknown,
}

impl DoorStatus {
    /// Classify a raw vendor door state. A missing value means no sensor.
    pub fn from_vendor(state: Option<&str>) -> Self {
        let Some(state) = state else {
            return Self::Disabled;
        };
        if DOOR_CLOSED.contains(&state) {
            Self::Closed
        } else if DOOR_OPEN.contains(&state) {
            Self::Open
        } else if DOOR_DISABLED.contains(&state) {
            Self::Disabled
        } else {
            Self::Unknown
        }
    }

    /// The normalized door action token, for states that have one.
    pub fn action(self) -> Option<&'static str> {
        match self {
            Self::Open => Some("dooropen"),
            Self::Closed => Some("doorclosed"),
            Self::Disabled | Self::Unknown => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn vendor_lock_strings_classify() {
        assert_eq!(LockStatus::from_vendor("kAugLockState_SecureMode"), LockStatus::Locked);
        assert_eq!(LockStatus::from_vendor("unlatched"), LockStatus::Unlatched);
        assert_eq!(LockStatus::from_vendor("kAugLockState_Unlocking"), LockStatus::Unlocking);
        assert_eq!(
            LockStatus::from_vendor("FAILED_BRIDGE_ERROR_LOCK_JAMMED"),
            LockStatus::Jammed
        );
        assert_eq!(LockStatus::from_vendor("kAugLockState_Locked "), LockStatus::Unknown);
    }

    #[test]
    fn only_travelling_states_are_moving() {
        let moving: Vec<_> = [
            LockStatus::Locked,
            LockStatus::Unlocked,
            LockStatus::Locking,
            LockStatus::Unlocking,
            LockStatus::Unlatched,
            LockStatus::Unlatching,
            LockStatus::Jammed,
            LockStatus::Unknown,
        ]
        .into_iter()
        .filter(|s| s.is_moving())
        .collect();
        assert_eq!(
            moving,
            vec![LockStatus::Locking, LockStatus::Unlocking, LockStatus::Unlatching]
        );
    }

    #[test]
    fn door_states_classify() {
        assert_eq!(DoorStatus::from_vendor(Some("kAugDoorState_Closed")), DoorStatus::Closed);
        assert_eq!(DoorStatus::from_vendor(Some("open")), DoorStatus::Open);
        assert_eq!(DoorStatus::from_vendor(Some("init")), DoorStatus::Disabled);
        assert_eq!(DoorStatus::from_vendor(Some("")), DoorStatus::Disabled);
        assert_eq!(DoorStatus::from_vendor(None), DoorStatus::Disabled);
        assert_eq!(DoorStatus::from_vendor(Some("kAugDoorState_Ajar")), DoorStatus::Unknown);
        assert_eq!(DoorStatus::Closed.action(), Some("doorclosed"));
        assert_eq!(DoorStatus::Unknown.action(), None);
    }

    #[test]
    fn status_display_is_snake_case() {
        assert_eq!(LockStatus::Unlatching.to_string(), "unlatching");
        assert_eq!("jammed".parse::<LockStatus>().unwrap(), LockStatus::Jammed);
    }
}
