//! End-to-end hot-plug scenarios driven through the watcher threads.

use mute_manager_rs::{
    AggregateMode, AppState, Command, ControlEvent, DataFlow, DeviceId, EngineConfig,
    RegistryConfig, VirtualBackend, VolumeControl,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(3);

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn fast_config(mode: AggregateMode) -> EngineConfig {
    EngineConfig {
        aggregate_mode: mode,
        registry: RegistryConfig {
            debounce_ms: 10,
            fallback_interval_ms: 60_000,
            subscription_retry_ms: 20,
        },
        sample_interval_ms: 5,
        ..EngineConfig::default()
    }
}

fn start(mode: AggregateMode) -> (VirtualBackend, AppState) {
    let backend = VirtualBackend::new();
    backend.add_endpoint_with_state(DataFlow::Capture, "mic-a", "Headset", false, 0.6);
    backend.add_endpoint_with_state(DataFlow::Capture, "mic-b", "Webcam", false, 0.8);
    let app = AppState::new(Arc::new(backend.clone()), fast_config(mode)).unwrap();
    (backend, app)
}

#[test]
fn plugged_device_inherits_session_state() {
    let (backend, app) = start(AggregateMode::Synchronizing);
    app.handle(DataFlow::Capture, Command::Mute);
    app.handle(DataFlow::Capture, Command::SetVolume(0.4));

    backend.add_endpoint_with_state(DataFlow::Capture, "mic-c", "USB Mic", false, 1.0);

    assert!(wait_for(|| backend.hardware_mute("mic-c") == Some(true)));
    assert_eq!(backend.hardware_volume("mic-c"), Some(0.4));

    let status = app.status(DataFlow::Capture);
    assert_eq!(status.is_muted, Some(true));
    assert_eq!(status.volume, Some(0.4));
    assert_eq!(status.sync.map(|s| s.seeded_members), Some(1));
}

#[test]
fn unplugged_device_is_retired() {
    let (backend, app) = start(AggregateMode::Synchronizing);
    assert_eq!(backend.volume_watchers("mic-a"), 1);

    backend.remove_endpoint("mic-a");

    let controller = app.controller(DataFlow::Capture);
    assert!(wait_for(|| controller.member(&DeviceId::new("mic-a")).is_none()));
    assert_eq!(app.devices(DataFlow::Capture).len(), 2);
    assert!(wait_for(|| backend.volume_watchers("mic-a") == 0));
}

#[test]
fn selection_survives_unplug_and_replug() {
    let (backend, app) = start(AggregateMode::Reducing);
    app.handle(DataFlow::Capture, Command::Select(DeviceId::new("mic-b")));
    let controller = app.controller(DataFlow::Capture);
    assert_eq!(controller.active_device_id(), DeviceId::new("mic-b"));

    backend.remove_endpoint("mic-b");
    assert!(wait_for(|| controller.active_device_id().is_all()));
    // Reads fall back to the aggregate of what is left
    assert_eq!(controller.volume(), Some(0.6));
    assert_eq!(controller.device_id(), DeviceId::new("mic-b"));

    backend.add_endpoint_with_state(DataFlow::Capture, "mic-b", "Webcam", true, 0.3);
    assert!(wait_for(|| controller.active_device_id() == DeviceId::new("mic-b")));
    assert_eq!(controller.mute(), Some(true));
    assert_eq!(controller.volume(), Some(0.3));
}

#[test]
fn hardware_change_reaches_facade_observers() {
    let (backend, app) = start(AggregateMode::Synchronizing);
    let controller = app.controller(DataFlow::Capture);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = controller.subscribe(Box::new(move |event: &ControlEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    // Someone presses the hardware mute button on the headset
    backend.set_hardware_mute("mic-a", true);

    assert!(wait_for(|| controller.mute() == Some(true)));
    assert!(seen
        .lock()
        .unwrap()
        .contains(&ControlEvent::MuteChanged(Some(true))));
    // Adopted, not pushed to the other member
    assert_eq!(backend.hardware_mute("mic-b"), Some(false));
}

#[test]
fn fan_out_writes_each_member_once() {
    let (backend, app) = start(AggregateMode::Synchronizing);
    let controller = app.controller(DataFlow::Capture);
    backend.add_endpoint(DataFlow::Capture, "mic-c", "USB Mic");
    assert!(wait_for(|| controller.member(&DeviceId::new("mic-c")).is_some()));
    // Seeding echoes settle before the counters are sampled
    std::thread::sleep(Duration::from_millis(50));
    let before = controller.sync_stats().unwrap_or_default();

    app.handle(DataFlow::Capture, Command::Mute);

    for id in ["mic-a", "mic-b", "mic-c"] {
        assert_eq!(backend.hardware_mute(id), Some(true));
    }
    let after = controller.sync_stats().unwrap_or_default();
    assert_eq!(after.fan_out_writes - before.fan_out_writes, 3);

    // Let the hardware echoes drain; none of them may count as adoptions
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        controller.sync_stats().unwrap_or_default().member_adoptions,
        before.member_adoptions
    );
}

#[test]
fn rejected_registration_is_retried() {
    let backend = VirtualBackend::new();
    backend.reject_next_subscriptions(3);
    let app = AppState::new(
        Arc::new(backend.clone()),
        fast_config(AggregateMode::Synchronizing),
    )
    .unwrap();

    assert!(wait_for(|| {
        backend.device_watchers(DataFlow::Capture) == 1
            && backend.device_watchers(DataFlow::Render) == 1
    }));

    backend.add_endpoint(DataFlow::Render, "spk", "Speakers");
    assert!(wait_for(|| app.devices(DataFlow::Render).len() == 2));
}

#[test]
fn shutdown_releases_hot_plug_registrations() {
    let (backend, app) = start(AggregateMode::Synchronizing);
    assert!(wait_for(|| backend.device_watchers(DataFlow::Capture) == 1));

    drop(app);
    assert_eq!(backend.device_watchers(DataFlow::Capture), 0);
    assert_eq!(backend.device_watchers(DataFlow::Render), 0);
    assert_eq!(backend.volume_watchers("mic-a"), 0);
}
