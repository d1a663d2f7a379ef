// ── Latest-activity resolver ──
//
// Decides which of two activities for the same device and activity type
// describes the current state, and keeps the per-device table of winners.
// Push and REST deliveries are both merged here, in any order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use crate::model::{Activity, ActivityType};

/// Pick the activity that describes the current state.
///
/// A transitional candidate never displaces an existing activity. Otherwise
/// the candidate wins when it starts no earlier than `current`, so at equal
/// timestamps a terminal state replaces a transitional one.
pub fn latest_activity<'a>(candidate: &'a Activity, current: Option<&'a Activity>) -> &'a Activity {
    match current {
        None => candidate,
        Some(current) if !candidate.is_moving() && current.start_time <= candidate.start_time => {
            candidate
        }
        Some(current) => current,
    }
}

/// Per-device, per-type table of the latest known activity.
///
/// Entries are never removed.
#[derive(Debug, Default)]
pub struct LatestActivities {
    devices: DashMap<String, HashMap<ActivityType, Arc<Activity>>>,
}

impl LatestActivities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one activity. Returns `true` when its slot changed.
    pub fn update(&self, activity: &Activity) -> bool {
        let mut slots = self.devices.entry(activity.device_id.clone()).or_default();
        let activity_type = activity.activity_type();
        let current = slots.get(&activity_type).map(AsRef::as_ref);

        let winner = latest_activity(activity, current);
        if !std::ptr::eq(winner, activity) || current == Some(activity) {
            return false;
        }
        trace!(
            device_id = %activity.device_id,
            action = %activity.action,
            %activity_type,
            "latest activity updated"
        );
        slots.insert(activity_type, Arc::new(activity.clone()));
        true
    }

    /// Merge a batch. Returns the ids of devices with at least one changed slot.
    pub fn process_newer_device_activities<'a, I>(&self, activities: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a Activity>,
    {
        activities
            .into_iter()
            .filter(|activity| self.update(activity))
            .map(|activity| activity.device_id.clone())
            .collect()
    }

    /// The most recent activity among the requested types.
    pub fn get_latest_device_activity(
        &self,
        device_id: &str,
        types: &[ActivityType],
    ) -> Option<Arc<Activity>> {
        let slots = self.devices.get(device_id)?;
        types
            .iter()
            .filter_map(|t| slots.get(t))
            .max_by_key(|activity| activity.start_time)
            .cloned()
    }

    /// Start time of the newest activity among the requested types.
    pub fn latest_start_time(&self, device_id: &str, types: &[ActivityType]) -> Option<DateTime<Utc>> {
        self.get_latest_device_activity(device_id, types)
            .map(|activity| activity.start_time)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
