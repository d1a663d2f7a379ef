// ── Subscription registry ──
//
// Per-device change callbacks. While at least one subscription exists a
// periodic fallback refresh runs, so stale state is bounded even when push
// delivery silently stops.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Periodic refresh body, run once per interval tick.
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Callbacks keyed by device id, in registration order.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    subscriptions: Mutex<IndexMap<String, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
    refresh: Option<(RefreshFn, Duration)>,
    refresh_task: Mutex<Option<RefreshTask>>,
    cancel: CancellationToken,
}

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::build(None, CancellationToken::new())
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("devices", &self.subscribed_device_ids())
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// A registry without a periodic refresh.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that runs `refresh` every `interval` while anyone is subscribed.
    pub fn with_refresh(interval: Duration, refresh: RefreshFn, cancel: CancellationToken) -> Self {
        Self::build(Some((refresh, interval)), cancel)
    }

    fn build(refresh: Option<(RefreshFn, Duration)>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscriptions: Mutex::new(IndexMap::new()),
                next_id: AtomicU64::new(0),
                refresh,
                refresh_task: Mutex::new(None),
                cancel,
            }),
        }
    }

    /// Register `callback` for changes to `device_id`.
    ///
    /// Starts the periodic refresh if it is not running yet. A subscription
    /// made outside a tokio runtime cannot start it; the next one made inside
    /// a runtime does. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, device_id: &str, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions()
            .entry(device_id.to_owned())
            .or_default()
            .push((id, Arc::new(callback)));
        self.inner.start_refresh();
        Subscription {
            registry: Arc::downgrade(&self.inner),
            device_id: device_id.to_owned(),
            id,
            active: true,
        }
    }

    /// Run every callback registered for `device_id`, in registration order.
    ///
    /// Callbacks run over a snapshot, so they may subscribe or unsubscribe
    /// freely. A panicking callback is logged and does not stop the others.
    pub fn notify(&self, device_id: &str) {
        let snapshot: Vec<Callback> = match self.inner.subscriptions().get(device_id) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        trace!(device_id, callbacks = snapshot.len(), "notifying subscribers");
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(callback.as_ref())).is_err() {
                error!(device_id, "subscriber callback panicked");
            }
        }
    }

    pub fn subscribed_device_ids(&self) -> Vec<String> {
        self.inner.subscriptions().keys().cloned().collect()
    }

    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.inner.subscriptions().contains_key(device_id)
    }

    /// Whether the periodic refresh task is running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh_task().is_some()
    }

    /// Stop the periodic refresh for good. Subscriptions stay registered.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.stop_refresh();
    }
}

impl RegistryInner {
    fn subscriptions(&self) -> MutexGuard<'_, IndexMap<String, Vec<(u64, Callback)>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_task(&self) -> MutexGuard<'_, Option<RefreshTask>> {
        self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, device_id: &str, id: u64) {
        let now_empty = {
            let mut subs = self.subscriptions();
            if let Some(callbacks) = subs.get_mut(device_id) {
                callbacks.retain(|(cb_id, _)| *cb_id != id);
                if callbacks.is_empty() {
                    subs.shift_remove(device_id);
                }
            }
            subs.is_empty()
        };
        if now_empty {
            self.stop_refresh();
        }
    }

    fn start_refresh(&self) {
        let Some((refresh, period)) = &self.refresh else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, periodic refresh not started");
            return;
        };

        let mut slot = self.refresh_task();
        if slot.is_some() {
            return;
        }
        let cancel = self.cancel.child_token();
        let handle = runtime.spawn(refresh_loop(Arc::clone(refresh), *period, cancel.clone()));
        debug!(period_secs = period.as_secs(), "periodic refresh started");
        *slot = Some(RefreshTask { cancel, handle });
    }

    fn stop_refresh(&self) {
        let task = self.refresh_task().take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
            debug!("periodic refresh stopped");
        }
    }
}

async fn refresh_loop(refresh: RefreshFn, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                trace!("periodic refresh tick");
                refresh().await;
            }
        }
    }
}

// ── Subscription handle ─────────────────────────────────────────────

/// Live subscription. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    device_id: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.device_id, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("device_id", &self.device_id)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::FutureExt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn() + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> Box<dyn Fn() + Send + Sync> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn notifies_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let (log, make) = recorder();
        let _a = registry.subscribe("lock", make("a"));
        let _b = registry.subscribe("lock", make("b"));
        let _other = registry.subscribe("doorbell", make("other"));

        registry.notify("lock");
        registry.notify("unknown");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn panicking_callback_does_not_stop_siblings() {
        let registry = SubscriptionRegistry::new();
        let (log, make) = recorder();
        let _bad = registry.subscribe("lock", || panic!("boom"));
        let _good = registry.subscribe("lock", make("good"));

        registry.notify("lock");
        assert_eq!(*log.lock().unwrap(), vec!["good"]);
    }

    #[test]
    fn unsubscribe_during_notify_uses_snapshot() {
        let registry = SubscriptionRegistry::new();
        let (log, make) = recorder();
        let held: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&held);
        let _first = registry.subscribe("lock", move || {
            drop(slot.lock().unwrap().take());
        });
        *held.lock().unwrap() = Some(registry.subscribe("lock", make("second")));

        registry.notify("lock");
        assert_eq!(*log.lock().unwrap(), vec!["second"]);

        registry.notify("lock");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn drop_and_unsubscribe_remove_the_device() {
        let registry = SubscriptionRegistry::new();
        let a = registry.subscribe("lock", || {});
        let b = registry.subscribe("lock", || {});
        assert_eq!(a.device_id(), "lock");

        a.unsubscribe();
        assert!(registry.is_subscribed("lock"));
        drop(b);
        assert!(!registry.is_subscribed("lock"));
        assert!(registry.subscribed_device_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_runs_only_while_subscribed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let refresh: RefreshFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });
        let registry =
            SubscriptionRegistry::with_refresh(Duration::from_secs(10), refresh, CancellationToken::new());
        assert!(!registry.is_refreshing());

        let first = registry.subscribe("a", || {});
        let second = registry.subscribe("b", || {});
        assert!(registry.is_refreshing());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        drop(first);
        assert!(registry.is_refreshing());
        drop(second);
        assert!(!registry.is_refreshing());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refresh_starts_once_a_runtime_is_available() {
        let refresh: RefreshFn = Arc::new(|| async {}.boxed());
        let registry =
            SubscriptionRegistry::with_refresh(Duration::from_secs(10), refresh, CancellationToken::new());
        let _outside = registry.subscribe("a", || {});
        assert!(!registry.is_refreshing());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let _inside = registry.subscribe("b", || {});
            assert!(registry.is_refreshing());
        });
        // "a" is still subscribed
        assert!(registry.is_refreshing());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_registry_never_restarts_refresh() {
        let refresh: RefreshFn = Arc::new(|| async {}.boxed());
        let registry =
            SubscriptionRegistry::with_refresh(Duration::from_secs(10), refresh, CancellationToken::new());
        let sub = registry.subscribe("a", || {});
        registry.stop();
        assert!(!registry.is_refreshing());

        drop(sub);
        let _again = registry.subscribe("a", || {});
        assert!(!registry.is_refreshing());
    }
}
