// ── Vendor action vocabulary ──
//
// Every activity carries an action token. The token alone decides which
// activity variant it becomes and which lock or door state it implies.
// Tokens are vendor-fixed; unknown ones are dropped by the normalizer.

use super::status::{DoorStatus, LockStatus};

pub const ACTION_LOCK: &str = "lock";
pub const ACTION_UNLOCK: &str = "unlock";
pub const ACTION_UNLATCH: &str = "unlatch";
pub const ACTION_LOCKING: &str = "locking";
pub const ACTION_UNLOCKING: &str = "unlocking";
pub const ACTION_UNLATCHING: &str = "unlatching";
pub const ACTION_JAMMED: &str = "jammed";
pub const ACTION_AUTO_LOCK: &str = "auto_lock";

pub const ACTION_DOOR_OPEN: &str = "dooropen";
pub const ACTION_DOOR_CLOSED: &str = "doorclosed";

pub const ACTION_BRIDGE_ONLINE: &str = "associated_bridge_online";
pub const ACTION_BRIDGE_OFFLINE: &str = "associated_bridge_offline";

pub const ACTION_DOORBELL_MOTION_DETECTED: &str = "doorbell_motion_detected";
pub const ACTION_DOORBELL_IMAGE_CAPTURE: &str = "imagecapture";
pub const ACTION_DOORBELL_BUTTON_PUSHED: &str = "buttonpush";

/// Calling-user id the vendor uses for auto-relock events.
pub const AUTORELOCK_USER_ID: &str = "automaticrelock";

/// The activity variant an action token maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    LockOperation,
    DoorOperation,
    BridgeOperation,
    DoorbellMotion,
    DoorbellImageCapture,
    DoorbellDing,
    DoorbellView,
}

pub fn action_kind(action: &str) -> Option<ActionKind> {
    let kind = match action {
        "lock" | "unlock" | "unlatch" | "locking" | "unlocking" | "unlatching" | "jammed"
        | "onetouchlock" | "one_touch_lock" | "auto_lock" | "rf_secure" | "rf_lock"
        | "rf_unlock" | "rf_unlatch" | "ble_lock" | "ble_unlock" | "ble_unlatch"
        | "remote_lock" | "remote_unlock" | "remote_unlatch" | "pin_unlock" | "pin_unlatch"
        | "manual_lock" | "manual_unlock" | "manual_unlatch" | "homekey_lock"
        | "homekey_unlock" | "homekey_unlatch" => ActionKind::LockOperation,
        "dooropen" | "door_open" | "doorclosed" | "door_close" => ActionKind::DoorOperation,
        "associated_bridge_online" | "associated_bridge_offline" => ActionKind::BridgeOperation,
        "doorbell_motion_detected" => ActionKind::DoorbellMotion,
        "imagecapture" => ActionKind::DoorbellImageCapture,
        "doorbell_call_initiated" => ActionKind::DoorbellView,
        "buttonpush" | "doorbell_call_missed" | "doorbell_call_hangup"
        | "doorbell_button_pushed" => ActionKind::DoorbellDing,
        _ => return None,
    };
    Some(kind)
}

/// Device state implied by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Lock(LockStatus),
    Door(DoorStatus),
}

pub fn action_state(action: &str) -> Option<ActionState> {
    let state = match action {
        "lock" | "onetouchlock" | "one_touch_lock" | "auto_lock" | "rf_secure" | "rf_lock"
        | "ble_lock" | "remote_lock" | "manual_lock" | "homekey_lock" => {
            ActionState::Lock(LockStatus::Locked)
        }
        "unlock" | "rf_unlock" | "ble_unlock" | "remote_unlock" | "pin_unlock"
        | "manual_unlock" | "homekey_unlock" => ActionState::Lock(LockStatus::Unlocked),
        "unlatch" | "rf_unlatch" | "ble_unlatch" | "remote_unlatch" | "pin_unlatch"
        | "manual_unlatch" | "homekey_unlatch" => ActionState::Lock(LockStatus::Unlatched),
        "locking" => ActionState::Lock(LockStatus::Locking),
        "unlocking" => ActionState::Lock(LockStatus::Unlocking),
        "unlatching" => ActionState::Lock(LockStatus::Unlatching),
        "jammed" => ActionState::Lock(LockStatus::Jammed),
        "dooropen" | "door_open" => ActionState::Door(DoorStatus::Open),
        "doorclosed" | "door_close" => ActionState::Door(DoorStatus::Closed),
        _ => return None,
    };
    Some(state)
}

/// `locking`, `unlocking` and `unlatching`.
pub fn is_moving_action(action: &str) -> bool {
    matches!(action_state(action), Some(ActionState::Lock(status)) if status.is_moving())
}

/// Display name for operations that have no human operator.
pub fn fallback_operator(action: &str) -> Option<(&'static str, &'static str)> {
    let name = match action {
        "rf_secure" => ("Radio Frequency", "Secure"),
        "rf_lock" => ("Radio Frequency", "Lock"),
        "rf_unlock" => ("Radio Frequency", "Unlock"),
        "rf_unlatch" => ("Radio Frequency", "Unlatch"),
        "auto_lock" => ("Auto", "Lock"),
        "onetouchlock" | "one_touch_lock" => ("One-Touch", "Lock"),
        "ble_lock" => ("Bluetooth", "Lock"),
        "ble_unlock" => ("Bluetooth", "Unlock"),
        "ble_unlatch" => ("Bluetooth", "Unlatch"),
        "manual_lock" => ("Manual", "Lock"),
        "manual_unlock" => ("Manual", "Unlock"),
        "manual_unlatch" => ("Manual", "Unlatch"),
        "homekey_lock" => ("HomeKey", "Lock"),
        "homekey_unlock" => ("HomeKey", "Unlock"),
        "homekey_unlatch" => ("HomeKey", "Unlatch"),
        _ => return None,
    };
    Some(name)
}

pub fn is_remote_action(action: &str) -> bool {
    matches!(action, "remote_lock" | "remote_unlock" | "remote_unlatch")
}

pub fn is_keypad_action(action: &str) -> bool {
    matches!(
        action,
        "onetouchlock" | "one_touch_lock" | "pin_unlock" | "pin_unlatch"
    )
}

pub fn is_manual_action(action: &str) -> bool {
    matches!(action, "manual_lock" | "manual_unlock" | "manual_unlatch")
}

pub fn is_tag_action(action: &str) -> bool {
    action.starts_with("rf_") || action.starts_with("homekey_")
}

pub fn is_autorelock_action(action: &str) -> bool {
    action == ACTION_AUTO_LOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_lock_action_implies_a_lock_state() {
        for action in [
            "lock", "unlock", "unlatch", "locking", "unlocking", "unlatching", "jammed",
            "onetouchlock", "one_touch_lock", "auto_lock", "rf_secure", "rf_lock", "rf_unlock",
            "rf_unlatch", "ble_lock", "ble_unlock", "ble_unlatch", "remote_lock",
            "remote_unlock", "remote_unlatch", "pin_unlock", "pin_unlatch", "manual_lock",
            "manual_unlock", "manual_unlatch", "homekey_lock", "homekey_unlock",
            "homekey_unlatch",
        ] {
            assert_eq!(action_kind(action), Some(ActionKind::LockOperation), "{action}");
            assert!(
                matches!(action_state(action), Some(ActionState::Lock(_))),
                "{action} has no lock state"
            );
        }
    }

    #[test]
    fn doorbell_and_bridge_tokens() {
        assert_eq!(action_kind("buttonpush"), Some(ActionKind::DoorbellDing));
        assert_eq!(action_kind("doorbell_call_initiated"), Some(ActionKind::DoorbellView));
        assert_eq!(action_kind("imagecapture"), Some(ActionKind::DoorbellImageCapture));
        assert_eq!(
            action_kind("associated_bridge_offline"),
            Some(ActionKind::BridgeOperation)
        );
        assert_eq!(action_state("buttonpush"), None);
        assert_eq!(action_kind("status"), None);
        assert_eq!(action_kind("doorbell_reboot"), None);
    }

    #[test]
    fn moving_actions() {
        assert!(is_moving_action("locking"));
        assert!(is_moving_action("unlatching"));
        assert!(!is_moving_action("unlock"));
        assert!(!is_moving_action("dooropen"));
    }

    #[test]
    fn operator_flag_sets() {
        assert!(is_remote_action("remote_unlatch"));
        assert!(is_keypad_action("pin_unlock"));
        assert!(is_keypad_action("one_touch_lock"));
        assert!(is_manual_action("manual_lock"));
        assert!(is_tag_action("rf_unlock"));
        assert!(is_tag_action("homekey_unlatch"));
        assert!(!is_tag_action("remote_unlock"));
        assert!(is_autorelock_action("auto_lock"));
    }

    #[test]
    fn fallback_names() {
        assert_eq!(fallback_operator("rf_unlock"), Some(("Radio Frequency", "Unlock")));
        assert_eq!(fallback_operator("one_touch_lock"), Some(("One-Touch", "Lock")));
        assert_eq!(fallback_operator("unlock"), None);
        assert_eq!(fallback_operator("pin_unlock"), None);
    }
}
