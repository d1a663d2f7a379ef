//! Activity reconciliation between push delivery and the REST activity log.
//!
//! This crate owns the domain model and the state machines that keep a
//! smart-lock client's view of its devices current:
//!
//! - **Normalizer** ([`normalize`]) turns vendor JSON from the activity log,
//!   push messages and lock operation responses into [`Activity`] values.
//!   Unknown actions are dropped, never errors.
//!
//! - **Resolver** ([`latest_activity`], [`LatestActivities`]) decides which
//!   of two activities describes the current state. Terminal states beat
//!   transitional ones at equal timestamps.
//!
//! - **[`ActivityStream`]** runs the debounced per-house refresh scheduler.
//!   A push event buys a short burst of activity-log polls so operator
//!   details catch up with the state push already reported.
//!
//! - **[`RateLimiter`]** gates on-device wakeups per access token.
//!
//! - **[`Reconciler`]** is the push entry point tying the pieces together
//!   with the [`DeviceDetailCache`] and [`SubscriptionRegistry`].
//!
//! Vendor I/O goes through the [`ActivityBackend`] and [`PushConnection`]
//! traits; `doorlink-api` provides the production implementations.

pub mod backend;
pub mod config;
pub mod detail;
pub mod error;
pub mod model;
pub mod normalize;
pub mod ratelimit;
pub mod reconciler;
pub mod resolver;
pub mod stream;
pub mod subscriber;
pub mod users;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::{ActivityBackend, ApiBackend, PushConnection};
pub use config::StreamConfig;
pub use detail::{DeviceDetail, DeviceDetailCache, DoorbellDetail, LiveAttrs, LockDetail};
pub use error::CoreError;
pub use normalize::{
    DeviceKind, DeviceRef, activities_from_lock_result, activities_from_log, activities_from_push,
    activity_from_log,
};
pub use ratelimit::{RateLimiter, WAKEUP_INTERVAL};
pub use reconciler::{Reconciler, SharedState};
pub use resolver::{LatestActivities, latest_activity};
pub use stream::ActivityStream;
pub use subscriber::{Subscription, SubscriptionRegistry};
pub use users::{User, UserDirectory};

pub use model::{
    Activity, ActivityDetails, ActivityType, DoorStatus, DoorbellCall, DoorbellImage, LockOperation,
    LockStatus, Source,
};
