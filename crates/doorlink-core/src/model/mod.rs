// ── Domain model ──
//
// Canonical representation of lock and doorbell activities, plus the
// vendor vocabularies they are derived from.

pub mod action;
pub mod activity;
pub mod status;

// ── Re-exports ──────────────────────────────────────────────────────

pub use action::{ActionKind, ActionState};
pub use activity::{
    Activity, ActivityDetails, ActivityType, DoorbellCall, DoorbellImage, LockOperation, Source,
};
pub use status::{DoorStatus, LockStatus};
