//! Controller bound to one hardware endpoint.
//!
//! The controller is either unbound (reads `None`, writes are no-ops) or
//! bound to an [`EndpointHandle`] obtained from the registry. Every
//! transition first invalidates the cached values, publishes that, and only
//! then re-queries the hardware, so observers never act on a stale reading
//! from the previous binding.
//!
//! Hardware notifications arrive on backend threads. They are pushed into a
//! channel and a per-binding worker rate-limits them through a [`Sampler`]
//! before they reach the cache. A binding generation number discards
//! notifications that outlive their binding.

use super::{normalize_volume, ControlEvent, ControlListener, VolumeControl};
use crate::audio::{DeviceId, EndpointHandle, VolumeNotification};
use crate::events::{lock, Notifier, Subscription};
use crate::registry::{DeviceRegistry, LiveSetChange};
use crate::sampling::Sampler;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Binding {
    handle: Arc<dyn EndpointHandle>,
    _watch: Subscription,
}

struct SingleState {
    device_id: DeviceId,
    binding: Option<Binding>,
    mute: Option<bool>,
    volume: Option<f32>,
    generation: u64,
}

struct SingleInner {
    registry: DeviceRegistry,
    sample_interval: Duration,
    state: Mutex<SingleState>,

    /// Serializes bind/unbind transitions
    transition: Mutex<()>,

    notifier: Notifier<ControlEvent>,
}

/// Mute/volume of one endpoint.
pub struct SingleDeviceController {
    inner: Arc<SingleInner>,
    _registry: Subscription,
}

impl SingleDeviceController {
    /// Create a controller for `device_id` and bind it if the endpoint is live.
    pub fn new(registry: DeviceRegistry, device_id: DeviceId, sample_interval: Duration) -> Self {
        let inner = Arc::new(SingleInner {
            registry: registry.clone(),
            sample_interval,
            state: Mutex::new(SingleState {
                device_id,
                binding: None,
                mute: None,
                volume: None,
                generation: 0,
            }),
            transition: Mutex::new(()),
            notifier: Notifier::new(),
        });

        let weak = Arc::downgrade(&inner);
        let registry_sub = registry.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_live_set_change(change);
            }
        });

        inner.rebind();
        Self {
            inner,
            _registry: registry_sub,
        }
    }

    /// Select another endpoint. Rebinds immediately.
    pub fn set_device_id(&self, device_id: DeviceId) {
        {
            let _transition = lock(&self.inner.transition);
            let mut state = lock(&self.inner.state);
            if state.device_id == device_id {
                return;
            }
            state.device_id = device_id.clone();
        }

        debug!(device_id = %device_id, "Device selection changed");
        self.inner.notifier.emit(&ControlEvent::DeviceChanged(device_id));
        self.inner.rebind();
    }
}

impl SingleInner {
    fn on_live_set_change(self: &Arc<Self>, change: &LiveSetChange) {
        let (device_id, bound) = {
            let state = lock(&self.state);
            (state.device_id.clone(), state.binding.is_some())
        };

        if (bound && change.was_removed(&device_id)) || (!bound && change.was_added(&device_id)) {
            self.rebind();
        }
    }

    /// Drop the current binding and try to acquire a new one.
    fn rebind(self: &Arc<Self>) {
        let _transition = lock(&self.transition);

        let (old_binding, device_id, generation, had_mute, had_volume) = {
            let mut state = lock(&self.state);
            state.generation += 1;
            (
                state.binding.take(),
                state.device_id.clone(),
                state.generation,
                state.mute.take(),
                state.volume.take(),
            )
        };

        let was_bound = old_binding.is_some();
        drop(old_binding);

        if had_mute.is_some() {
            self.notifier.emit(&ControlEvent::MuteChanged(None));
        }
        if had_volume.is_some() {
            self.notifier.emit(&ControlEvent::VolumeChanged(None));
        }
        if was_bound {
            info!(device_id = %device_id, "Unbound from endpoint");
            self.notifier.emit(&ControlEvent::ConnectedChanged(false));
        }

        let Some(handle) = self.registry.handle_for(&device_id) else {
            debug!(device_id = %device_id, "Endpoint not available, staying unbound");
            return;
        };

        let (mute, volume) = match (handle.mute(), handle.volume()) {
            (Ok(mute), Ok(volume)) => (mute, volume),
            (Err(e), _) | (_, Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Failed to read endpoint state");
                return;
            }
        };

        let watch = self.watch(&handle, generation);

        {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return;
            }
            state.binding = Some(Binding {
                handle,
                _watch: watch,
            });
            state.mute = Some(mute);
            state.volume = Some(volume);
        }

        info!(device_id = %device_id, mute, volume, "Bound to endpoint");
        self.notifier.emit(&ControlEvent::ConnectedChanged(true));
        self.notifier.emit(&ControlEvent::MuteChanged(Some(mute)));
        self.notifier.emit(&ControlEvent::VolumeChanged(Some(volume)));
    }

    /// Register for hardware notifications of `handle` and start the worker
    /// that applies them.
    fn watch(self: &Arc<Self>, handle: &Arc<dyn EndpointHandle>, generation: u64) -> Subscription {
        let (tx, rx) = mpsc::channel::<VolumeNotification>();
        let sink = Box::new(move |notification: VolumeNotification| {
            let _ = tx.send(notification);
        });

        let watch = match handle.watch(sink) {
            Ok(watch) => watch,
            Err(e) => {
                warn!(device_id = %handle.device_id(), error = %e, "Hardware notifications unavailable");
                return Subscription::empty();
            }
        };

        let weak = Arc::downgrade(self);
        let interval = self.sample_interval;
        let spawned = std::thread::Builder::new()
            .name(format!("endpoint-{}", handle.device_id()))
            .spawn(move || run_sampler(weak, generation, interval, rx));
        if let Err(e) = spawned {
            warn!(device_id = %handle.device_id(), error = %e, "Failed to spawn notification worker");
            return Subscription::empty();
        }
        watch
    }

    /// Apply a sampled hardware notification. Returns false once the binding
    /// it belongs to is gone.
    fn apply(&self, generation: u64, notification: VolumeNotification) -> bool {
        let mut events = Vec::with_capacity(2);
        {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return false;
            }
            // Binding is still being installed
            if state.binding.is_none() {
                return true;
            }
            if state.mute != Some(notification.muted) {
                state.mute = Some(notification.muted);
                events.push(ControlEvent::MuteChanged(state.mute));
            }
            let volume = normalize_volume(Some(notification.volume));
            if volume.is_some() && state.volume != volume {
                state.volume = volume;
                events.push(ControlEvent::VolumeChanged(volume));
            }
        }

        for event in &events {
            self.notifier.emit(event);
        }
        true
    }

    fn bound_handle(&self) -> Option<(Arc<dyn EndpointHandle>, u64)> {
        let state = lock(&self.state);
        state
            .binding
            .as_ref()
            .map(|binding| (binding.handle.clone(), state.generation))
    }

    /// Store a value we just wrote, returning true if it changed.
    fn store(&self, generation: u64, update: impl FnOnce(&mut SingleState) -> bool) -> bool {
        let mut state = lock(&self.state);
        state.generation == generation && update(&mut state)
    }
}

fn run_sampler(
    controller: Weak<SingleInner>,
    generation: u64,
    interval: Duration,
    rx: Receiver<VolumeNotification>,
) {
    let mut sampler = Sampler::new(interval, Instant::now());

    loop {
        let received = if sampler.has_pending() {
            let wait = sampler.next_tick().saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(notification) => Some(notification),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(notification) => Some(notification),
                Err(_) => break,
            }
        };

        if let Some(notification) = received {
            sampler.offer(notification);
        }

        if let Some(notification) = sampler.poll(Instant::now()) {
            let Some(inner) = controller.upgrade() else {
                break;
            };
            if !inner.apply(generation, notification) {
                break;
            }
        }
    }
}

impl VolumeControl for SingleDeviceController {
    fn device_id(&self) -> DeviceId {
        lock(&self.inner.state).device_id.clone()
    }

    fn mute(&self) -> Option<bool> {
        lock(&self.inner.state).mute
    }

    fn set_mute(&self, muted: Option<bool>) {
        let Some(muted) = muted else { return };
        let Some((handle, generation)) = self.inner.bound_handle() else {
            debug!(device_id = %self.device_id(), "Mute write ignored, not bound");
            return;
        };

        if let Err(e) = handle.set_mute(muted) {
            warn!(device_id = %handle.device_id(), error = %e, "Failed to set mute");
            return;
        }

        let changed = self.inner.store(generation, |state| {
            let changed = state.mute != Some(muted);
            state.mute = Some(muted);
            changed
        });
        if changed {
            self.inner.notifier.emit(&ControlEvent::MuteChanged(Some(muted)));
        }
    }

    fn volume(&self) -> Option<f32> {
        lock(&self.inner.state).volume
    }

    fn set_volume(&self, volume: Option<f32>) {
        let Some(volume) = normalize_volume(volume) else { return };
        let Some((handle, generation)) = self.inner.bound_handle() else {
            debug!(device_id = %self.device_id(), "Volume write ignored, not bound");
            return;
        };

        if let Err(e) = handle.set_volume(volume) {
            warn!(device_id = %handle.device_id(), error = %e, "Failed to set volume");
            return;
        }

        let changed = self.inner.store(generation, |state| {
            let changed = state.volume != Some(volume);
            state.volume = Some(volume);
            changed
        });
        if changed {
            self.inner.notifier.emit(&ControlEvent::VolumeChanged(Some(volume)));
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner.state).binding.is_some()
    }

    fn subscribe(&self, listener: ControlListener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }
}

impl std::fmt::Debug for SingleDeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SingleDeviceController")
            .field("device_id", &state.device_id)
            .field("bound", &state.binding.is_some())
            .field("mute", &state.mute)
            .field("volume", &state.volume)
            .finish()
    }
}
