//! Helpers shared by the unit tests.

use crate::audio::DeviceId;
use crate::config::RegistryConfig;
use crate::controller::{ControlEvent, ControlListener, SharedControl, VolumeControl};
use crate::events::{lock, Notifier, Subscription};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const FAST_SAMPLE: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn fast_registry_config() -> RegistryConfig {
    RegistryConfig {
        debounce_ms: 10,
        fallback_interval_ms: 60_000,
        subscription_retry_ms: 20,
    }
}

/// Records every event of a controller.
pub struct EventLog {
    events: Arc<Mutex<Vec<ControlEvent>>>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(control: &dyn VolumeControl) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = control.subscribe(Box::new(move |event: &ControlEvent| {
            lock(&sink).push(event.clone());
        }));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<ControlEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[derive(Default)]
struct FakeState {
    mute: Option<bool>,
    volume: Option<f32>,
    connected: bool,
    mute_writes: u32,
    volume_writes: u32,
}

/// Member controller with scripted state and write counters.
pub struct FakeMember {
    id: DeviceId,
    state: Mutex<FakeState>,
    notifier: Notifier<ControlEvent>,
}

impl FakeMember {
    pub fn new(id: &str, mute: Option<bool>, volume: Option<f32>) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::new(id),
            state: Mutex::new(FakeState {
                mute,
                volume,
                connected: mute.is_some() || volume.is_some(),
                ..FakeState::default()
            }),
            notifier: Notifier::new(),
        })
    }

    pub fn shared(id: &str) -> SharedControl {
        Self::new(id, Some(false), Some(1.0))
    }

    pub fn control(self: &Arc<Self>) -> SharedControl {
        self.clone()
    }

    /// Change state as if the hardware did it.
    pub fn external_mute(&self, muted: bool) {
        lock(&self.state).mute = Some(muted);
        self.notifier.emit(&ControlEvent::MuteChanged(Some(muted)));
    }

    pub fn external_volume(&self, volume: f32) {
        lock(&self.state).volume = Some(volume);
        self.notifier.emit(&ControlEvent::VolumeChanged(Some(volume)));
    }

    pub fn disconnect(&self) {
        {
            let mut state = lock(&self.state);
            state.mute = None;
            state.volume = None;
            state.connected = false;
        }
        self.notifier.emit(&ControlEvent::MuteChanged(None));
        self.notifier.emit(&ControlEvent::VolumeChanged(None));
        self.notifier.emit(&ControlEvent::ConnectedChanged(false));
    }

    pub fn mute_writes(&self) -> u32 {
        lock(&self.state).mute_writes
    }

    pub fn volume_writes(&self) -> u32 {
        lock(&self.state).volume_writes
    }
}

impl VolumeControl for FakeMember {
    fn device_id(&self) -> DeviceId {
        self.id.clone()
    }

    fn mute(&self) -> Option<bool> {
        lock(&self.state).mute
    }

    fn set_mute(&self, muted: Option<bool>) {
        let Some(muted) = muted else { return };
        let changed = {
            let mut state = lock(&self.state);
            state.mute_writes += 1;
            let changed = state.mute != Some(muted);
            state.mute = Some(muted);
            changed
        };
        if changed {
            self.notifier.emit(&ControlEvent::MuteChanged(Some(muted)));
        }
    }

    fn volume(&self) -> Option<f32> {
        lock(&self.state).volume
    }

    fn set_volume(&self, volume: Option<f32>) {
        let Some(volume) = volume else { return };
        let changed = {
            let mut state = lock(&self.state);
            state.volume_writes += 1;
            let changed = state.volume != Some(volume);
            state.volume = Some(volume);
            changed
        };
        if changed {
            self.notifier.emit(&ControlEvent::VolumeChanged(Some(volume)));
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn subscribe(&self, listener: ControlListener) -> Subscription {
        self.notifier.subscribe(listener)
    }
}
