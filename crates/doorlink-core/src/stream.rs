// ── Activity stream ──
//
// Debounced REST polling of house activity logs. Push messages tell us
// *that* something happened; the activity log tells us *who* did it, but
// lags push by a few seconds. A refresh request therefore schedules a short
// burst of polls spaced by the debounce cooldown, and a new request resets
// the burst rather than stacking on top of it.
//
// Per house, at most one fetch is in flight and at most one timer is armed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::backend::{ActivityBackend, PushConnection};
use crate::config::StreamConfig;
use crate::detail::DeviceDetailCache;
use crate::error::CoreError;
use crate::model::{Activity, ActivityType};
use crate::normalize;
use crate::resolver::LatestActivities;
use crate::subscriber::{RefreshFn, Subscription, SubscriptionRegistry};
use crate::users::UserDirectory;

/// Per-house refresh scheduler and latest-activity table.
///
/// Cheap to clone; clones share state. Scheduling methods spawn tokio tasks
/// and must be called inside a runtime.
pub struct ActivityStream<B, P> {
    inner: Arc<StreamInner<B, P>>,
}

impl<B, P> Clone for ActivityStream<B, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StreamInner<B, P> {
    backend: Arc<B>,
    push: P,
    config: StreamConfig,
    users: Arc<UserDirectory>,
    details: Arc<DeviceDetailCache>,
    latest: LatestActivities,
    registry: SubscriptionRegistry,
    /// Device id to house id, for scoping the periodic refresh.
    device_houses: DashMap<String, String>,
    state: Mutex<SchedulerState>,
    did_first_update: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    start_time: Option<Instant>,
    houses: IndexMap<String, HouseState>,
    next_generation: u64,
}

#[derive(Default)]
struct HouseState {
    /// Polls still owed for the current burst.
    pending: u32,
    running: bool,
    last_update: Option<Instant>,
    timer: Option<Timer>,
    task: Option<JoinHandle<()>>,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl SchedulerState {
    fn resync_complete(&self, now: Instant, initial_resync: Duration) -> bool {
        self.start_time
            .is_some_and(|start| now.saturating_duration_since(start) > initial_resync)
    }
}

impl HouseState {
    fn busy(&self, now: Instant, cooldown: Duration) -> bool {
        self.running || self.last_update.is_some_and(|last| last + cooldown > now)
    }

    fn begin_update(&mut self, now: Instant) {
        self.running = true;
        self.pending = self.pending.saturating_sub(1);
        self.last_update = Some(now);
    }
}

impl<B: ActivityBackend, P: PushConnection> ActivityStream<B, P> {
    /// Build a stream for `house_ids`. Nothing is fetched until [`setup`](Self::setup).
    pub fn new(
        backend: Arc<B>,
        push: P,
        house_ids: impl IntoIterator<Item = String>,
        users: Arc<UserDirectory>,
        details: Arc<DeviceDetailCache>,
        config: StreamConfig,
    ) -> Self {
        let houses = house_ids
            .into_iter()
            .map(|id| {
                let house = HouseState {
                    pending: 1,
                    ..HouseState::default()
                };
                (id, house)
            })
            .collect();
        let cancel = CancellationToken::new();

        let inner = Arc::new_cyclic(|weak: &Weak<StreamInner<B, P>>| {
            let weak = weak.clone();
            let refresh: RefreshFn = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.periodic_refresh();
                    }
                }
                .boxed()
            });
            StreamInner {
                backend,
                push,
                registry: SubscriptionRegistry::with_refresh(
                    config.activity_update_interval,
                    refresh,
                    cancel.child_token(),
                ),
                config,
                users,
                details,
                latest: LatestActivities::new(),
                device_houses: DashMap::new(),
                state: Mutex::new(SchedulerState {
                    houses,
                    ..SchedulerState::default()
                }),
                did_first_update: AtomicBool::new(false),
                cancel,
            }
        });
        Self { inner }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Catch up on every house once, unless push is already connected.
    pub async fn setup(&self) {
        let inner = &self.inner;
        let house_ids = {
            let mut state = inner.state();
            state.start_time = Some(Instant::now());
            state.houses.keys().cloned().collect::<Vec<_>>()
        };

        if inner.push.is_connected() {
            debug!("push connected, skipping initial activity fetch");
        } else {
            debug!(houses = house_ids.len(), "start retrieving device activities");
            // one house at a time to avoid hammering the API
            for house_id in house_ids {
                let started = {
                    let mut state = inner.state();
                    match state.houses.get_mut(&house_id) {
                        Some(house) if !house.running => {
                            house.begin_update(Instant::now());
                            true
                        }
                        _ => false,
                    }
                };
                if started {
                    Arc::clone(inner).run_update(house_id).await;
                }
            }
        }
        inner.did_first_update.store(true, Ordering::Release);
        info!("activity stream ready");
    }

    /// Cancel every timer and in-flight fetch. Safe to call repeatedly.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.registry.stop();

        let handles: Vec<JoinHandle<()>> = {
            let mut state = inner.state();
            state
                .houses
                .values_mut()
                .flat_map(|house| {
                    house.pending = 0;
                    let timer = house.timer.take().map(|t| t.handle);
                    timer.into_iter().chain(house.task.take())
                })
                .collect()
        };
        if !handles.is_empty() {
            debug!(handles = handles.len(), "activity stream stopped");
        }
        for handle in handles {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// Something changed in `house_id`; poll its activity log soon.
    ///
    /// Replaces any burst already owed for the house.
    pub fn on_house_refresh_request(&self, house_id: &str) {
        self.inner.schedule_house_refresh(house_id);
    }

    /// Record which house `device_id` belongs to.
    ///
    /// The periodic refresh only polls houses with a subscribed device.
    /// Activities fetched from a house also record their devices.
    pub fn register_device(&self, device_id: &str, house_id: &str) {
        self.inner
            .device_houses
            .insert(device_id.to_owned(), house_id.to_owned());
    }

    /// Polls still owed for `house_id`.
    pub fn pending_updates(&self, house_id: &str) -> u32 {
        self.inner
            .state()
            .houses
            .get(house_id)
            .map_or(0, |house| house.pending)
    }

    pub fn is_update_running(&self, house_id: &str) -> bool {
        self.inner
            .state()
            .houses
            .get(house_id)
            .is_some_and(|house| house.running)
    }

    pub fn house_ids(&self) -> Vec<String> {
        self.inner.state().houses.keys().cloned().collect()
    }

    pub fn push_connected(&self) -> bool {
        self.inner.push.is_connected()
    }

    // ── Latest activities ────────────────────────────────────────────

    /// Merge activities into the latest table. Returns the devices that changed.
    pub fn process_newer_device_activities(&self, activities: &[Activity]) -> HashSet<String> {
        self.inner.latest.process_newer_device_activities(activities)
    }

    pub fn get_latest_device_activity(
        &self,
        device_id: &str,
        types: &[ActivityType],
    ) -> Option<Arc<Activity>> {
        self.inner.latest.get_latest_device_activity(device_id, types)
    }

    pub fn latest(&self) -> &LatestActivities {
        &self.inner.latest
    }

    // ── Subscribers ──────────────────────────────────────────────────

    pub fn subscribe<F>(&self, device_id: &str, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(device_id, callback)
    }

    pub fn notify(&self, device_id: &str) {
        self.inner.registry.notify(device_id);
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }
}

impl<B: ActivityBackend, P: PushConnection> StreamInner<B, P> {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_house_refresh(self: &Arc<Self>, house_id: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let now = Instant::now();
        let mut state = self.state();
        let resync_done = state.resync_complete(now, self.config.initial_resync);
        let house = state.houses.entry(house_id.to_owned()).or_default();
        if let Some(timer) = house.timer.take() {
            timer.handle.abort();
        }

        house.pending = if !resync_done {
            // still warming up, a single poll will do
            1
        } else if house.busy(now, self.config.debounce_cooldown) {
            2
        } else {
            3
        };
        let delay = self.update_delay(house, resync_done, now, false);
        self.schedule(&mut state, house_id, delay);
    }

    fn update_delay(&self, house: &HouseState, resync_done: bool, now: Instant, from_timer: bool) -> Duration {
        if house.busy(now, self.config.debounce_cooldown) {
            self.config.debounce_cooldown
        } else if !resync_done {
            self.config.initial_resync
        } else if from_timer {
            Duration::ZERO
        } else {
            self.config.update_soon
        }
    }

    fn schedule(self: &Arc<Self>, state: &mut SchedulerState, house_id: &str, delay: Duration) {
        if self.cancel.is_cancelled() {
            return;
        }
        let generation = state.next_generation;
        let Some(house) = state.houses.get_mut(house_id) else {
            return;
        };
        if house.pending == 0 {
            return;
        }
        state.next_generation += 1;

        debug!(
            house_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            pending = house.pending,
            "scheduling house activity update"
        );
        if let Some(timer) = house.timer.take() {
            timer.handle.abort();
        }
        let inner = Arc::clone(self);
        let id = house_id.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.on_timer(&id, generation);
        });
        house.timer = Some(Timer { generation, handle });
    }

    fn on_timer(self: &Arc<Self>, house_id: &str, generation: u64) {
        let now = Instant::now();
        let mut state = self.state();
        let resync_done = state.resync_complete(now, self.config.initial_resync);
        let Some(house) = state.houses.get_mut(house_id) else {
            return;
        };
        if house.timer.as_ref().map(|t| t.generation) != Some(generation) {
            // superseded by a newer request
            return;
        }
        house.timer = None;

        let delay = self.update_delay(house, resync_done, now, true);
        if delay.is_zero() {
            self.spawn_update(&mut state, house_id, now);
        } else {
            self.schedule(&mut state, house_id, delay);
        }
    }

    fn spawn_update(self: &Arc<Self>, state: &mut SchedulerState, house_id: &str, now: Instant) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(house) = state.houses.get_mut(house_id) else {
            return;
        };
        house.begin_update(now);
        let inner = Arc::clone(self);
        let id = house_id.to_owned();
        house.task = Some(tokio::spawn(inner.run_update(id)));
    }

    /// Fetch one house, then arm the next poll of the burst if one is owed.
    ///
    /// The house must already be marked running.
    async fn run_update(self: Arc<Self>, house_id: String) {
        let guard = RunningGuard {
            inner: &self,
            house_id: &house_id,
        };
        self.update_house(&house_id).await;

        {
            let now = Instant::now();
            let mut state = self.state();
            let resync_done = state.resync_complete(now, self.config.initial_resync);
            let delay = match state.houses.get(&house_id) {
                Some(house) if house.pending > 0 => {
                    debug!(house_id = %house_id, pending = house.pending, "pending updates for house");
                    // still running here, so this lands on the cooldown
                    Some(self.update_delay(house, resync_done, now, false))
                }
                _ => None,
            };
            if let Some(delay) = delay {
                self.schedule(&mut state, &house_id, delay);
            }
        }
        drop(guard);
    }

    async fn update_house(&self, house_id: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let limit = if self.did_first_update.load(Ordering::Acquire) {
            self.config.stream_fetch_limit
        } else {
            self.config.catch_up_fetch_limit
        };
        debug!(house_id, limit, "updating device activity for house");

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            result = self.backend.fetch_house_activities(house_id, limit) => result,
        };
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                error!(house_id, error = %e, "failed to retrieve activity for house");
                return;
            }
        };

        let activities = normalize::activities_from_log(&records, &self.users);
        for activity in &activities {
            if !self.device_houses.contains_key(&activity.device_id) {
                let house = activity.house_id.as_deref().unwrap_or(house_id);
                self.device_houses
                    .insert(activity.device_id.clone(), house.to_owned());
            }
        }
        trace!(house_id, records = records.len(), activities = activities.len(), "house activities fetched");
        self.apply_details(&activities);
        for device_id in self.latest.process_newer_device_activities(&activities) {
            debug!(device_id = %device_id, "device updated from activity stream");
            self.registry.notify(&device_id);
        }
    }

    fn apply_details(&self, activities: &[Activity]) {
        for activity in activities {
            match self.details.apply_activity(activity) {
                Ok(_) | Err(CoreError::UnknownDevice { .. }) => {}
                Err(e) => debug!(error = %e, "activity not applied to device detail"),
            }
        }
    }

    /// Fallback poll of every house with a subscribed device, driven by the
    /// subscription registry's interval.
    fn periodic_refresh(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.push.is_connected() {
            debug!("push updates are not connected, data may be stale");
        }
        let mut subscribed = HashSet::new();
        for device_id in self.registry.subscribed_device_ids() {
            match self.device_houses.get(&device_id) {
                Some(house_id) => {
                    subscribed.insert(house_id.value().clone());
                }
                None => trace!(device_id = %device_id, "subscribed device has no known house"),
            }
        }

        let now = Instant::now();
        let mut state = self.state();
        let idle: Vec<String> = state
            .houses
            .iter()
            .filter(|(id, house)| subscribed.contains(*id) && !house.running && house.timer.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for house_id in idle {
            self.spawn_update(&mut state, &house_id, now);
        }
    }
}

/// Clears the running flag when an update finishes or is aborted.
struct RunningGuard<'a, B: ActivityBackend, P: PushConnection> {
    inner: &'a StreamInner<B, P>,
    house_id: &'a str,
}

impl<B: ActivityBackend, P: PushConnection> Drop for RunningGuard<'_, B, P> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if let Some(house) = state.houses.get_mut(self.house_id) {
            house.running = false;
            house.task = None;
        }
    }
}
