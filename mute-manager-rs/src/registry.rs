//! Live endpoint registry.
//!
//! A [`DeviceRegistry`] owns the authoritative set of endpoints for one data
//! flow. Each refresh pass enumerates the backend, diffs the result against
//! the live set by [`DeviceId`] and publishes the difference as a single
//! [`LiveSetChange`]. Unchanged endpoints never produce events.
//!
//! The optional watcher thread turns hot-plug callbacks into debounced
//! refreshes, re-enumerates on a fallback timer and keeps retrying a
//! rejected hot-plug registration.

use crate::audio::{
    AudioError, DataFlow, DeviceDescriptor, DeviceEvent, DeviceId, EndpointBackend, EndpointHandle,
};
use crate::config::RegistryConfig;
use crate::events::{lock, Notifier, Subscription};
use crate::sampling::Debouncer;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Endpoints that appeared and disappeared during one refresh pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSetChange {
    pub added: Vec<DeviceDescriptor>,
    pub removed: Vec<DeviceDescriptor>,
}

impl LiveSetChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn was_added(&self, id: &DeviceId) -> bool {
        self.added.iter().any(|d| &d.id == id)
    }

    pub fn was_removed(&self, id: &DeviceId) -> bool {
        self.removed.iter().any(|d| &d.id == id)
    }
}

/// Compare two snapshots by id.
///
/// `added = next \ current`, `removed = current \ next`. Entries present in
/// both are ignored even if their display name changed.
pub fn diff(current: &[DeviceDescriptor], next: &[DeviceDescriptor]) -> LiveSetChange {
    let added = next
        .iter()
        .filter(|candidate| !current.iter().any(|d| d.id == candidate.id))
        .cloned()
        .collect();
    let removed = current
        .iter()
        .filter(|existing| !next.iter().any(|d| d.id == existing.id))
        .cloned()
        .collect();

    LiveSetChange { added, removed }
}

enum WatchMessage {
    Device(DeviceEvent),
    Stop,
}

struct Watcher {
    control: Sender<WatchMessage>,
    thread: Option<JoinHandle<()>>,
}

struct RegistryInner {
    flow: DataFlow,
    backend: Arc<dyn EndpointBackend>,
    config: RegistryConfig,

    /// Live endpoints, "all devices" entry first
    live: Mutex<Vec<DeviceDescriptor>>,

    /// Serializes refresh passes including their publication
    refresh_pass: Mutex<()>,

    notifier: Notifier<LiveSetChange>,
    watcher: Mutex<Option<Watcher>>,
}

/// Hot-plug aware endpoint set of one data flow. Clones share state.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry and populate it with a first enumeration.
    ///
    /// The watcher is not started; call [`Self::start_watching`] for live
    /// hot-plug tracking.
    pub fn new(backend: Arc<dyn EndpointBackend>, flow: DataFlow, config: RegistryConfig) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                flow,
                backend,
                config,
                live: Mutex::new(vec![DeviceDescriptor::all()]),
                refresh_pass: Mutex::new(()),
                notifier: Notifier::new(),
                watcher: Mutex::new(None),
            }),
        };
        registry.refresh();
        registry
    }

    pub fn flow(&self) -> DataFlow {
        self.inner.flow
    }

    /// Synchronous snapshot query against the backend, "all devices" first.
    pub fn enumerate_now(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        self.inner.enumerate_now()
    }

    /// Current live set, "all devices" first.
    pub fn live_set(&self) -> Vec<DeviceDescriptor> {
        lock(&self.inner.live).clone()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        lock(&self.inner.live).iter().any(|d| &d.id == id)
    }

    pub fn find(&self, id: &DeviceId) -> Option<DeviceDescriptor> {
        lock(&self.inner.live).iter().find(|d| &d.id == id).cloned()
    }

    /// Re-enumerate and publish the difference.
    ///
    /// Enumeration failures are logged and count as "no change".
    pub fn refresh(&self) -> LiveSetChange {
        self.inner.refresh()
    }

    /// Observe changes of the live set, one event per refresh pass.
    ///
    /// Listeners run while the pass is still in progress and must not call
    /// [`Self::refresh`] themselves.
    pub fn subscribe(&self, listener: impl Fn(&LiveSetChange) + Send + Sync + 'static) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }

    /// Hardware handle for a live endpoint.
    pub fn handle_for(&self, id: &DeviceId) -> Option<Arc<dyn EndpointHandle>> {
        if !id.is_endpoint() || !self.contains(id) {
            return None;
        }

        match self.inner.backend.open(id) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(device_id = %id, error = %e, "Failed to open endpoint");
                None
            }
        }
    }

    /// Start the background watcher. Calling it twice is harmless.
    pub fn start_watching(&self) -> Result<(), AudioError> {
        let mut slot = lock(&self.inner.watcher);
        if slot.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&self.inner);
        let backend = self.inner.backend.clone();
        let config = self.inner.config.clone();
        let flow = self.inner.flow;
        let sink_tx = tx.clone();

        let thread = std::thread::Builder::new()
            .name(format!("registry-{flow}"))
            .spawn(move || run_watcher(weak, flow, backend, config, sink_tx, rx))
            .map_err(|e| AudioError::SubscriptionFailed(format!("failed to spawn watcher: {e}")))?;

        info!(?flow, "Endpoint watcher started");
        *slot = Some(Watcher {
            control: tx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the watcher and release the hot-plug registration.
    pub fn stop_watching(&self) {
        let watcher = lock(&self.inner.watcher).take();
        if let Some(mut watcher) = watcher {
            let _ = watcher.control.send(WatchMessage::Stop);
            if let Some(thread) = watcher.thread.take() {
                if thread.thread().id() != std::thread::current().id() {
                    let _ = thread.join();
                }
            }
            info!(flow = ?self.inner.flow, "Endpoint watcher stopped");
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("flow", &self.inner.flow)
            .field("live", &self.live_set().len())
            .finish()
    }
}

impl RegistryInner {
    fn enumerate_now(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        let endpoints = self.backend.enumerate(self.flow)?;

        let mut snapshot = Vec::with_capacity(endpoints.len() + 1);
        snapshot.push(DeviceDescriptor::all());
        for endpoint in endpoints {
            if !endpoint.id.is_endpoint() {
                warn!(device_id = %endpoint.id, "Ignoring endpoint with reserved id");
                continue;
            }
            if snapshot.iter().any(|d: &DeviceDescriptor| d.id == endpoint.id) {
                continue;
            }
            snapshot.push(endpoint);
        }
        Ok(snapshot)
    }

    fn refresh(&self) -> LiveSetChange {
        let _pass = lock(&self.refresh_pass);

        let snapshot = match self.enumerate_now() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(flow = ?self.flow, error = %e, "Enumeration failed, keeping current endpoint set");
                return LiveSetChange::default();
            }
        };

        let change = {
            let mut live = lock(&self.live);
            let change = diff(&live, &snapshot);
            live.retain(|d| !change.was_removed(&d.id));
            live.extend(change.added.iter().cloned());
            change
        };

        if !change.is_empty() {
            for d in &change.added {
                info!(flow = ?self.flow, device_id = %d.id, name = %d.name, "Endpoint added");
            }
            for d in &change.removed {
                info!(flow = ?self.flow, device_id = %d.id, name = %d.name, "Endpoint removed");
            }
            self.notifier.emit(&change);
        }
        change
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        // The watcher may be the one dropping us, so never join here
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(watcher) = watcher {
            let _ = watcher.control.send(WatchMessage::Stop);
        }
    }
}

fn run_watcher(
    registry: Weak<RegistryInner>,
    flow: DataFlow,
    backend: Arc<dyn EndpointBackend>,
    config: RegistryConfig,
    tx: Sender<WatchMessage>,
    rx: Receiver<WatchMessage>,
) {
    let mut subscription: Option<Subscription> = None;
    let mut failed_attempts: u32 = 0;
    let mut next_attempt = Instant::now();
    let mut debouncer = Debouncer::new(config.debounce());
    let mut next_fallback = Instant::now() + config.fallback_interval();

    loop {
        let now = Instant::now();

        if subscription.is_none() && now >= next_attempt {
            let sink_tx = tx.clone();
            let sink = Box::new(move |event: DeviceEvent| {
                let _ = sink_tx.send(WatchMessage::Device(event));
            });
            match backend.subscribe(flow, sink) {
                Ok(sub) => {
                    debug!(?flow, attempts = failed_attempts + 1, "Hot-plug notifications registered");
                    subscription = Some(sub);
                    // Catch changes made before the registration took effect
                    debouncer.trigger(now);
                }
                Err(e) => {
                    failed_attempts += 1;
                    warn!(
                        ?flow,
                        error = %e,
                        retry_in = ?config.subscription_retry(),
                        "Hot-plug registration rejected, serving last known endpoints"
                    );
                    next_attempt = now + config.subscription_retry();
                }
            }
        }

        let debounced = debouncer.fire(now);
        if debounced || now >= next_fallback {
            let Some(inner) = registry.upgrade() else {
                break;
            };
            if !debounced {
                debug!(?flow, "Fallback re-enumeration");
            }
            inner.refresh();
            drop(inner);
            next_fallback = Instant::now() + config.fallback_interval();
            continue;
        }

        let mut deadline = next_fallback;
        if let Some(debounce_deadline) = debouncer.deadline() {
            deadline = deadline.min(debounce_deadline);
        }
        if subscription.is_none() {
            deadline = deadline.min(next_attempt);
        }

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(WatchMessage::Device(event)) => {
                debug!(?flow, ?event, "Endpoint notification");
                debouncer.trigger(Instant::now());
            }
            Ok(WatchMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    drop(subscription);
    debug!(?flow, "Endpoint watcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VirtualBackend;
    use crate::test_support::{fast_registry_config, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn descriptors(ids: &[&str]) -> Vec<DeviceDescriptor> {
        ids.iter().map(|id| DeviceDescriptor::new(*id, *id)).collect()
    }

    fn registry_with(backend: &VirtualBackend, config: RegistryConfig) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(backend.clone()), DataFlow::Capture, config)
    }

    fn counting(registry: &DeviceRegistry) -> (Arc<Mutex<Vec<LiveSetChange>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = registry.subscribe(move |change| lock(&s).push(change.clone()));
        (seen, sub)
    }

    #[test]
    fn test_diff_added_and_removed() {
        let change = diff(&descriptors(&["a", "b"]), &descriptors(&["b", "c"]));
        assert_eq!(change.added, descriptors(&["c"]));
        assert_eq!(change.removed, descriptors(&["a"]));
    }

    #[test]
    fn test_diff_ignores_unchanged_and_renamed() {
        let before = descriptors(&["a", "b"]);
        let after = vec![DeviceDescriptor::new("b", "renamed"), DeviceDescriptor::new("a", "a")];
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn test_live_set_starts_with_all_entry() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic");
        backend.add_endpoint(DataFlow::Render, "spk-1", "Speakers");

        let registry = registry_with(&backend, RegistryConfig::default());
        let live = registry.live_set();
        assert_eq!(live.len(), 2);
        assert!(live[0].id.is_all());
        assert_eq!(live[1].id, DeviceId::new("mic-1"));

        let snapshot = registry.enumerate_now().unwrap();
        assert!(snapshot[0].id.is_all());
    }

    #[test]
    fn test_refresh_publishes_incremental_change() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic 1");
        let registry = registry_with(&backend, RegistryConfig::default());
        let (seen, _sub) = counting(&registry);

        backend.add_endpoint(DataFlow::Capture, "mic-2", "Mic 2");
        backend.remove_endpoint("mic-1");
        let change = registry.refresh();

        assert_eq!(change.added, vec![DeviceDescriptor::new("mic-2", "Mic 2")]);
        assert!(change.was_removed(&DeviceId::new("mic-1")));
        assert_eq!(lock(&seen).len(), 1);
        assert!(registry.contains(&DeviceId::new("mic-2")));
        assert!(!registry.contains(&DeviceId::new("mic-1")));
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic");
        let registry = registry_with(&backend, RegistryConfig::default());
        let (seen, _sub) = counting(&registry);

        assert!(registry.refresh().is_empty());
        assert!(registry.refresh().is_empty());
        assert!(lock(&seen).is_empty());
    }

    #[test]
    fn test_enumeration_failure_keeps_live_set() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic");
        let registry = registry_with(&backend, RegistryConfig::default());
        let (seen, _sub) = counting(&registry);

        backend.set_fail_enumeration(true);
        backend.remove_endpoint("mic-1");
        assert!(registry.refresh().is_empty());
        assert!(registry.contains(&DeviceId::new("mic-1")));
        assert!(lock(&seen).is_empty());

        backend.set_fail_enumeration(false);
        assert!(registry.refresh().was_removed(&DeviceId::new("mic-1")));
    }

    #[test]
    fn test_handle_for_requires_live_endpoint() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic");
        let registry = registry_with(&backend, RegistryConfig::default());

        assert!(registry.handle_for(&DeviceId::new("mic-1")).is_some());
        assert!(registry.handle_for(&DeviceId::all()).is_none());
        assert!(registry.handle_for(&DeviceId::empty()).is_none());

        // Present in hardware but not yet picked up by a refresh
        backend.add_endpoint(DataFlow::Capture, "mic-2", "Mic 2");
        assert!(registry.handle_for(&DeviceId::new("mic-2")).is_none());
    }

    #[test]
    fn test_watcher_debounces_hot_plug_bursts() {
        let backend = VirtualBackend::new();
        let config = RegistryConfig {
            debounce_ms: 50,
            ..fast_registry_config()
        };
        let registry = registry_with(&backend, config);
        let (seen, _sub) = counting(&registry);
        registry.start_watching().unwrap();
        assert!(wait_until(Duration::from_secs(2), || backend.device_watchers(DataFlow::Capture) == 1));
        // Let the post-registration pass run before the burst
        std::thread::sleep(Duration::from_millis(150));

        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic 1");
        backend.add_endpoint(DataFlow::Capture, "mic-2", "Mic 2");
        backend.add_endpoint(DataFlow::Capture, "mic-3", "Mic 3");

        assert!(wait_until(Duration::from_secs(2), || registry.live_set().len() == 4));
        let changes = lock(&seen).clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added.len(), 3);

        registry.stop_watching();
        assert_eq!(backend.device_watchers(DataFlow::Capture), 0);
    }

    #[test]
    fn test_change_before_registration_is_picked_up() {
        let backend = VirtualBackend::new();
        backend.add_endpoint(DataFlow::Capture, "mic-old", "Old Mic");
        let registry = registry_with(&backend, fast_registry_config());

        // Race the watcher thread's hot-plug registration
        registry.start_watching().unwrap();
        backend.add_endpoint(DataFlow::Capture, "mic-new", "New Mic");
        backend.remove_endpoint("mic-old");

        assert!(wait_until(Duration::from_secs(2), || {
            registry.contains(&DeviceId::new("mic-new"))
                && !registry.contains(&DeviceId::new("mic-old"))
        }));
        registry.stop_watching();
    }

    #[test]
    fn test_watcher_retries_rejected_subscription() {
        let backend = VirtualBackend::new();
        backend.reject_next_subscriptions(2);
        let registry = registry_with(&backend, fast_registry_config());
        registry.start_watching().unwrap();

        assert!(wait_until(Duration::from_secs(2), || backend.device_watchers(DataFlow::Capture) == 1));
        assert!(backend.subscription_attempts() >= 3);
        registry.stop_watching();
    }

    #[test]
    fn test_fallback_timer_catches_missed_notifications() {
        let backend = VirtualBackend::new();
        backend.set_hot_plug_notifications(false);
        let config = RegistryConfig {
            fallback_interval_ms: 30,
            ..fast_registry_config()
        };
        let registry = registry_with(&backend, config);
        registry.start_watching().unwrap();

        backend.add_endpoint(DataFlow::Capture, "mic-1", "Mic");
        assert!(wait_until(Duration::from_secs(2), || registry.contains(&DeviceId::new("mic-1"))));
        registry.stop_watching();
    }

    #[test]
    fn test_dropping_registry_stops_watcher() {
        let backend = VirtualBackend::new();
        let registry = registry_with(&backend, fast_registry_config());
        registry.start_watching().unwrap();
        assert!(wait_until(Duration::from_secs(2), || backend.device_watchers(DataFlow::Capture) == 1));

        drop(registry);
        assert!(wait_until(Duration::from_secs(2), || backend.device_watchers(DataFlow::Capture) == 0));
    }

    #[test]
    fn test_listener_count_per_pass() {
        let backend = VirtualBackend::new();
        let registry = registry_with(&backend, RegistryConfig::default());
        let passes = Arc::new(AtomicUsize::new(0));
        let p = passes.clone();
        let _sub = registry.subscribe(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });

        backend.add_endpoint(DataFlow::Capture, "a", "A");
        backend.add_endpoint(DataFlow::Capture, "b", "B");
        registry.refresh();
        assert_eq!(passes.load(Ordering::SeqCst), 1);
    }
}
