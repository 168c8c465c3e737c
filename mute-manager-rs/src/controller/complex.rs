//! Façade routing by selected device id.
//!
//! A [`ComplexController`] owns one [`SingleDeviceController`] per live
//! endpoint of its registry plus the "all devices" aggregate over them. The
//! selected id decides which one reads and writes go to. A selection that is
//! not (or no longer) live routes to the aggregate but is remembered, so the
//! device takes over again as soon as it reappears.

use super::members::MemberSet;
use super::single::SingleDeviceController;
use super::sync::{SyncStats, SynchronizingAggregateController};
use super::{AggregateController, ControlEvent, ControlListener, SharedControl, VolumeControl};
use crate::audio::DeviceId;
use crate::config::AggregateMode;
use crate::events::{lock, Notifier, Subscription};
use crate::registry::DeviceRegistry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

enum Aggregate {
    Reducing(Arc<AggregateController>),
    Synchronizing(Arc<SynchronizingAggregateController>),
}

impl Aggregate {
    fn control(&self) -> SharedControl {
        match self {
            Aggregate::Reducing(aggregate) => aggregate.clone(),
            Aggregate::Synchronizing(aggregate) => aggregate.clone(),
        }
    }
}

struct Routing {
    selected: DeviceId,

    /// Member in use; `None` routes to the aggregate
    active: Option<SharedControl>,

    token: u64,
    forward: Option<Subscription>,

    // Last published values
    mute: Option<bool>,
    volume: Option<f32>,
    connected: bool,
}

struct ComplexInner {
    registry: DeviceRegistry,
    sample_interval: Duration,
    members: Arc<MemberSet>,
    aggregate: Aggregate,
    routing: Mutex<Routing>,

    /// Serializes membership reconciliation
    reconcile: Mutex<()>,

    /// Serializes switching the active controller
    selection: Mutex<()>,

    notifier: Notifier<ControlEvent>,
}

pub struct ComplexController {
    inner: Arc<ComplexInner>,
    _registry: Subscription,
}

impl ComplexController {
    /// Build member controllers for the registry's live endpoints and select
    /// "all devices".
    pub fn new(registry: DeviceRegistry, mode: AggregateMode, sample_interval: Duration) -> Self {
        let members = Arc::new(MemberSet::new());
        let initial = registry
            .live_set()
            .into_iter()
            .filter(|d| d.id.is_endpoint())
            .map(|d| {
                Arc::new(SingleDeviceController::new(registry.clone(), d.id, sample_interval))
                    as SharedControl
            })
            .collect();
        members.apply(initial, &[]);

        let aggregate = match mode {
            AggregateMode::Reducing => {
                Aggregate::Reducing(Arc::new(AggregateController::new(members.clone())))
            }
            AggregateMode::Synchronizing => Aggregate::Synchronizing(Arc::new(
                SynchronizingAggregateController::new(members.clone()),
            )),
        };

        let inner = Arc::new(ComplexInner {
            registry: registry.clone(),
            sample_interval,
            members,
            aggregate,
            routing: Mutex::new(Routing {
                selected: DeviceId::all(),
                active: None,
                token: 0,
                forward: None,
                mute: None,
                volume: None,
                connected: false,
            }),
            reconcile: Mutex::new(()),
            selection: Mutex::new(()),
            notifier: Notifier::new(),
        });

        let weak = Arc::downgrade(&inner);
        let registry_sub = registry.subscribe(move |_change| {
            if let Some(inner) = weak.upgrade() {
                inner.reconcile();
            }
        });

        // Catch anything that changed before we subscribed
        inner.reconcile();
        inner.resolve();

        info!(flow = ?registry.flow(), ?mode, members = inner.members.len(), "Controller ready");
        Self {
            inner,
            _registry: registry_sub,
        }
    }

    /// Change the selection. "All" (or an empty id) selects the aggregate.
    pub fn set_device_id(&self, device_id: DeviceId) {
        let device_id = if device_id.is_empty() {
            DeviceId::all()
        } else {
            device_id
        };

        let changed = {
            let mut routing = lock(&self.inner.routing);
            if routing.selected == device_id {
                false
            } else {
                routing.selected = device_id.clone();
                true
            }
        };

        if changed {
            let name = self.inner.registry.find(&device_id).map(|d| d.name);
            info!(device_id = %device_id, ?name, "Device selected");
            self.inner
                .notifier
                .emit(&ControlEvent::DeviceChanged(device_id.clone()));
        }
        self.inner.resolve();

        if device_id.is_endpoint() && !self.inner.members.contains(&device_id) {
            info!(device_id = %device_id, "Selected device is not present, routing to all devices");
        }
    }

    /// Id of the controller actually serving reads and writes.
    pub fn active_device_id(&self) -> DeviceId {
        lock(&self.inner.routing)
            .active
            .as_ref()
            .map(|active| active.device_id())
            .unwrap_or_else(DeviceId::all)
    }

    /// Flip mute of the active controller. An unknown state mutes.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.mute().unwrap_or(false);
        self.set_mute(Some(muted));
        muted
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn members(&self) -> &Arc<MemberSet> {
        &self.inner.members
    }

    pub fn member(&self, device_id: &DeviceId) -> Option<SharedControl> {
        self.inner.members.get(device_id)
    }

    pub fn aggregate(&self) -> SharedControl {
        self.inner.aggregate.control()
    }

    /// Counters of the synchronizing aggregate, if that mode is in use.
    pub fn sync_stats(&self) -> Option<SyncStats> {
        match &self.inner.aggregate {
            Aggregate::Synchronizing(aggregate) => Some(aggregate.stats()),
            Aggregate::Reducing(_) => None,
        }
    }
}

impl ComplexInner {
    /// Align members with the registry's live set in one batch.
    fn reconcile(self: &Arc<Self>) {
        {
            let _reconcile = lock(&self.reconcile);
            let live = self.registry.live_set();

            let added: Vec<SharedControl> = live
                .iter()
                .filter(|d| d.id.is_endpoint() && !self.members.contains(&d.id))
                .map(|d| {
                    debug!(device_id = %d.id, "Creating member controller");
                    Arc::new(SingleDeviceController::new(
                        self.registry.clone(),
                        d.id.clone(),
                        self.sample_interval,
                    )) as SharedControl
                })
                .collect();

            let removed: Vec<DeviceId> = self
                .members
                .snapshot()
                .iter()
                .map(|m| m.device_id())
                .filter(|id| !live.iter().any(|d| &d.id == id))
                .collect();

            if added.is_empty() && removed.is_empty() {
                return;
            }
            for id in &removed {
                debug!(device_id = %id, "Retiring member controller");
            }
            self.members.apply(added, &removed);
        }

        self.resolve();
    }

    fn active(&self) -> SharedControl {
        lock(&self.routing)
            .active
            .clone()
            .unwrap_or_else(|| self.aggregate.control())
    }

    /// Point the routing at the member matching the selection, or at the
    /// aggregate.
    fn resolve(self: &Arc<Self>) {
        let Some((token, control)) = self.switch_active() else {
            return;
        };

        // Announced without the selection lock so listeners may reselect
        self.forward(token, &ControlEvent::MuteChanged(control.mute()));
        self.forward(token, &ControlEvent::VolumeChanged(control.volume()));
        self.forward(token, &ControlEvent::ConnectedChanged(control.is_connected()));
    }

    /// Install the controller matching the selection. Returns the new routing
    /// token and controller, or `None` when nothing changed.
    fn switch_active(self: &Arc<Self>) -> Option<(u64, SharedControl)> {
        let _selection = lock(&self.selection);

        let (selected, current, installed) = {
            let routing = lock(&self.routing);
            (
                routing.selected.clone(),
                routing.active.clone(),
                routing.forward.is_some(),
            )
        };

        let target = if selected.is_endpoint() {
            self.members.get(&selected)
        } else {
            None
        };

        let unchanged = match (&current, &target) {
            (None, None) => installed,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if unchanged {
            return None;
        }

        let control = target.clone().unwrap_or_else(|| self.aggregate.control());
        let weak = Arc::downgrade(self);
        let (token, previous) = {
            let mut routing = lock(&self.routing);
            routing.token += 1;
            let token = routing.token;
            routing.active = target;
            (token, routing.forward.take())
        };
        drop(previous);

        let forward = control.subscribe(Box::new(move |event: &ControlEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.forward(token, event);
            }
        }));
        {
            let mut routing = lock(&self.routing);
            if routing.token == token {
                routing.forward = Some(forward);
            }
        }

        info!(selected = %selected, active = %control.device_id(), "Active controller changed");
        Some((token, control))
    }

    /// Re-publish an event of the active controller if it changes anything.
    fn forward(&self, token: u64, event: &ControlEvent) {
        let publish = {
            let mut routing = lock(&self.routing);
            if routing.token != token {
                return;
            }
            match *event {
                ControlEvent::MuteChanged(mute) if routing.mute != mute => {
                    routing.mute = mute;
                    true
                }
                ControlEvent::VolumeChanged(volume) if routing.volume != volume => {
                    routing.volume = volume;
                    true
                }
                ControlEvent::ConnectedChanged(connected) if routing.connected != connected => {
                    routing.connected = connected;
                    true
                }
                _ => false,
            }
        };

        if publish {
            self.notifier.emit(event);
        }
    }
}

impl VolumeControl for ComplexController {
    /// The selected id, which may differ from [`ComplexController::active_device_id`].
    fn device_id(&self) -> DeviceId {
        lock(&self.inner.routing).selected.clone()
    }

    fn mute(&self) -> Option<bool> {
        let mute = self.inner.active().mute();
        if mute.is_none() {
            debug!(device_id = %self.device_id(), "No mute state for selection");
        }
        mute
    }

    fn set_mute(&self, muted: Option<bool>) {
        let active = self.inner.active();
        if !active.is_connected() {
            debug!(device_id = %self.device_id(), "Mute write on disconnected selection");
        }
        active.set_mute(muted);
    }

    fn volume(&self) -> Option<f32> {
        let volume = self.inner.active().volume();
        if volume.is_none() {
            debug!(device_id = %self.device_id(), "No volume for selection");
        }
        volume
    }

    fn set_volume(&self, volume: Option<f32>) {
        let active = self.inner.active();
        if !active.is_connected() {
            debug!(device_id = %self.device_id(), "Volume write on disconnected selection");
        }
        active.set_volume(volume);
    }

    fn is_connected(&self) -> bool {
        self.inner.active().is_connected()
    }

    /// Events caused by hot-plug arrive while the registry's refresh pass is
    /// still running; listeners must not refresh the registry themselves.
    /// Changing the selection from a listener is fine.
    fn subscribe(&self, listener: ControlListener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DataFlow, VirtualBackend};
    use crate::config::RegistryConfig;
    use crate::test_support::{EventLog, FAST_SAMPLE};

    fn setup(mode: AggregateMode) -> (VirtualBackend, DeviceRegistry, ComplexController) {
        let backend = VirtualBackend::new();
        backend.add_endpoint_with_state(DataFlow::Render, "X", "Speakers", false, 0.8);
        backend.add_endpoint_with_state(DataFlow::Render, "Y", "Headphones", false, 0.5);
        let registry = DeviceRegistry::new(
            Arc::new(backend.clone()),
            DataFlow::Render,
            RegistryConfig::default(),
        );
        let controller = ComplexController::new(registry.clone(), mode, FAST_SAMPLE);
        (backend, registry, controller)
    }

    #[test]
    fn test_defaults_to_aggregate() {
        let (_backend, _registry, controller) = setup(AggregateMode::Synchronizing);
        assert!(controller.device_id().is_all());
        assert!(controller.active_device_id().is_all());
        assert_eq!(controller.members().len(), 2);
        assert_eq!(controller.mute(), Some(false));
        assert_eq!(controller.volume(), Some(0.5));
        assert!(controller.is_connected());
    }

    #[test]
    fn test_routes_to_selected_device() {
        let (backend, _registry, controller) = setup(AggregateMode::Synchronizing);
        controller.set_device_id(DeviceId::new("X"));

        assert_eq!(controller.active_device_id(), DeviceId::new("X"));
        assert_eq!(controller.volume(), Some(0.8));

        controller.set_mute(Some(true));
        assert_eq!(backend.mute_writes("X"), 1);
        assert_eq!(backend.mute_writes("Y"), 0);
    }

    #[test]
    fn test_unknown_selection_falls_back_to_aggregate() {
        let (_backend, _registry, controller) = setup(AggregateMode::Reducing);
        controller.set_device_id(DeviceId::new("missing"));

        assert_eq!(controller.device_id(), DeviceId::new("missing"));
        assert!(controller.active_device_id().is_all());
        assert_eq!(controller.mute(), controller.aggregate().mute());
        assert_eq!(controller.volume(), Some(0.5));
    }

    #[test]
    fn test_remembered_selection_takes_over_when_plugged() {
        let (backend, registry, controller) = setup(AggregateMode::Synchronizing);
        controller.set_device_id(DeviceId::new("Z"));
        assert!(controller.active_device_id().is_all());

        backend.add_endpoint_with_state(DataFlow::Render, "Z", "USB DAC", false, 0.3);
        registry.refresh();

        assert_eq!(controller.active_device_id(), DeviceId::new("Z"));
        assert!(controller.member(&DeviceId::new("Z")).is_some());
    }

    #[test]
    fn test_removal_retires_member_and_falls_back() {
        let (backend, registry, controller) = setup(AggregateMode::Synchronizing);
        controller.set_device_id(DeviceId::new("X"));

        backend.remove_endpoint("X");
        registry.refresh();

        assert!(controller.member(&DeviceId::new("X")).is_none());
        assert!(controller.active_device_id().is_all());
        assert_eq!(controller.device_id(), DeviceId::new("X"));
        assert_eq!(backend.volume_watchers("X"), 0);
    }

    #[test]
    fn test_hot_plugged_device_is_seeded() {
        let (backend, registry, controller) = setup(AggregateMode::Synchronizing);
        controller.set_mute(Some(true));
        controller.set_volume(Some(0.4));

        backend.add_endpoint_with_state(DataFlow::Render, "W", "Monitor", false, 1.0);
        registry.refresh();

        assert_eq!(backend.hardware_mute("W"), Some(true));
        assert_eq!(backend.hardware_volume("W"), Some(0.4));
        assert_eq!(controller.sync_stats().map(|s| s.seeded_members), Some(1));
    }

    #[test]
    fn test_toggle_unknown_state_mutes() {
        let backend = VirtualBackend::new();
        let registry = DeviceRegistry::new(
            Arc::new(backend.clone()),
            DataFlow::Capture,
            RegistryConfig::default(),
        );
        let controller =
            ComplexController::new(registry, AggregateMode::Synchronizing, FAST_SAMPLE);

        assert_eq!(controller.mute(), None);
        assert!(controller.toggle_mute());
        assert_eq!(controller.mute(), Some(true));
        assert!(!controller.toggle_mute());
    }

    #[test]
    fn test_selection_events() {
        let (_backend, _registry, controller) = setup(AggregateMode::Synchronizing);
        let log = EventLog::attach(&controller);

        controller.set_device_id(DeviceId::new("X"));
        assert_eq!(
            log.events(),
            vec![
                ControlEvent::DeviceChanged(DeviceId::new("X")),
                ControlEvent::VolumeChanged(Some(0.8)),
            ]
        );

        log.clear();
        controller.set_device_id(DeviceId::new("X"));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_forwards_active_controller_events() {
        let (_backend, _registry, controller) = setup(AggregateMode::Reducing);
        controller.set_device_id(DeviceId::new("Y"));
        let log = EventLog::attach(&controller);

        controller.set_mute(Some(true));
        assert_eq!(log.events(), vec![ControlEvent::MuteChanged(Some(true))]);
    }

    #[test]
    fn test_listener_may_change_selection() {
        use crate::test_support::wait_until;

        let (_backend, _registry, controller) = setup(AggregateMode::Synchronizing);
        let controller = Arc::new(controller);
        let weak = Arc::downgrade(&controller);
        // Bounce back to all devices as soon as X announces its volume
        let _sub = controller.subscribe(Box::new(move |event: &ControlEvent| {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if *event == ControlEvent::VolumeChanged(Some(0.8))
                && controller.device_id() == DeviceId::new("X")
            {
                controller.set_device_id(DeviceId::all());
            }
        }));

        let c = controller.clone();
        let worker = std::thread::spawn(move || c.set_device_id(DeviceId::new("X")));
        assert!(wait_until(Duration::from_secs(2), || worker.is_finished()));

        assert!(controller.device_id().is_all());
        assert!(controller.active_device_id().is_all());
        assert_eq!(controller.volume(), Some(0.5));
    }
}
