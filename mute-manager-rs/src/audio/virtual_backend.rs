//! In-memory endpoint backend.
//!
//! Stands in for the OS audio stack on hosts without a native backend and in
//! tests. Endpoints are added and removed by hand, which raises the same
//! hot-plug callbacks a real device would, and "hardware" volume changes can
//! be injected to simulate another application touching the mixer.

use super::backend::{DeviceEventSink, EndpointBackend, EndpointHandle, VolumeSink};
use super::device::{
    AudioError, DataFlow, DeviceDescriptor, DeviceEvent, DeviceId, VolumeNotification,
};
use crate::events::{lock, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

#[derive(Debug, Clone)]
struct VirtualEndpoint {
    flow: DataFlow,
    descriptor: DeviceDescriptor,
    muted: bool,
    volume: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct WriteCounts {
    mute: u32,
    volume: u32,
}

#[derive(Default)]
struct VirtualState {
    endpoints: Vec<VirtualEndpoint>,
    writes: HashMap<DeviceId, WriteCounts>,
    device_sinks: Vec<(u64, DataFlow, Arc<DeviceEventSink>)>,
    volume_sinks: Vec<(u64, DeviceId, Arc<VolumeSink>)>,
    next_sink_id: u64,
    fail_enumeration: bool,
    rejected_subscriptions: u32,
    subscription_attempts: u32,
    notifications_muted: bool,
}

impl VirtualState {
    fn endpoint_mut(&mut self, device_id: &DeviceId) -> Option<&mut VirtualEndpoint> {
        self.endpoints
            .iter_mut()
            .find(|endpoint| &endpoint.descriptor.id == device_id)
    }

    fn device_sinks_for(&self, flow: DataFlow) -> Vec<Arc<DeviceEventSink>> {
        if self.notifications_muted {
            return Vec::new();
        }
        self.device_sinks
            .iter()
            .filter(|(_, sink_flow, _)| *sink_flow == flow)
            .map(|(_, _, sink)| sink.clone())
            .collect()
    }

    fn volume_sinks_for(&self, device_id: &DeviceId) -> Vec<Arc<VolumeSink>> {
        self.volume_sinks
            .iter()
            .filter(|(_, id, _)| id == device_id)
            .map(|(_, _, sink)| sink.clone())
            .collect()
    }
}

/// Scriptable in-memory backend. Clones share the same endpoints.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in an endpoint (unmuted, full volume).
    pub fn add_endpoint(&self, flow: DataFlow, device_id: &str, name: &str) {
        self.add_endpoint_with_state(flow, device_id, name, false, 1.0);
    }

    /// Plug in an endpoint with the given power-on state.
    pub fn add_endpoint_with_state(
        &self,
        flow: DataFlow,
        device_id: &str,
        name: &str,
        muted: bool,
        volume: f32,
    ) {
        let sinks = {
            let mut state = lock(&self.state);
            let id = DeviceId::new(device_id);
            state.endpoints.retain(|endpoint| endpoint.descriptor.id != id);
            state.endpoints.push(VirtualEndpoint {
                flow,
                descriptor: DeviceDescriptor::new(id, name),
                muted,
                volume: volume.clamp(0.0, 1.0),
            });
            state.device_sinks_for(flow)
        };

        debug!(device_id, ?flow, "Virtual endpoint added");
        for sink in sinks {
            sink(DeviceEvent::DeviceAdded {
                device_id: device_id.to_string(),
            });
        }
    }

    /// Unplug an endpoint. Returns false if it was not present.
    pub fn remove_endpoint(&self, device_id: &str) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let id = DeviceId::new(device_id);
            let position = state
                .endpoints
                .iter()
                .position(|endpoint| endpoint.descriptor.id == id);
            position.map(|index| {
                let endpoint = state.endpoints.remove(index);
                state.device_sinks_for(endpoint.flow)
            })
        };

        match removed {
            Some(sinks) => {
                debug!(device_id, "Virtual endpoint removed");
                for sink in sinks {
                    sink(DeviceEvent::DeviceRemoved {
                        device_id: device_id.to_string(),
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Change mute from "outside" (another application, a hardware button).
    pub fn set_hardware_mute(&self, device_id: &str, muted: bool) {
        self.update_hardware(&DeviceId::new(device_id), |endpoint| endpoint.muted = muted);
    }

    /// Change volume from "outside".
    pub fn set_hardware_volume(&self, device_id: &str, volume: f32) {
        self.update_hardware(&DeviceId::new(device_id), |endpoint| {
            endpoint.volume = volume.clamp(0.0, 1.0)
        });
    }

    /// Change mute without raising a notification, as if the callback got lost.
    pub fn set_hardware_mute_silently(&self, device_id: &str, muted: bool) {
        let mut state = lock(&self.state);
        if let Some(endpoint) = state.endpoint_mut(&DeviceId::new(device_id)) {
            endpoint.muted = muted;
        }
    }

    pub fn hardware_mute(&self, device_id: &str) -> Option<bool> {
        let mut state = lock(&self.state);
        state
            .endpoint_mut(&DeviceId::new(device_id))
            .map(|endpoint| endpoint.muted)
    }

    pub fn hardware_volume(&self, device_id: &str) -> Option<f32> {
        let mut state = lock(&self.state);
        state
            .endpoint_mut(&DeviceId::new(device_id))
            .map(|endpoint| endpoint.volume)
    }

    /// Number of `set_mute` calls made through handles for this endpoint.
    pub fn mute_writes(&self, device_id: &str) -> u32 {
        lock(&self.state)
            .writes
            .get(&DeviceId::new(device_id))
            .map(|counts| counts.mute)
            .unwrap_or(0)
    }

    /// Number of `set_volume` calls made through handles for this endpoint.
    pub fn volume_writes(&self, device_id: &str) -> u32 {
        lock(&self.state)
            .writes
            .get(&DeviceId::new(device_id))
            .map(|counts| counts.volume)
            .unwrap_or(0)
    }

    /// Make every enumeration fail until cleared.
    pub fn set_fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    /// Reject the next `count` hot-plug registrations.
    pub fn reject_next_subscriptions(&self, count: u32) {
        lock(&self.state).rejected_subscriptions = count;
    }

    /// Suppress hot-plug callbacks, leaving only re-enumeration to notice changes.
    pub fn set_hot_plug_notifications(&self, enabled: bool) {
        lock(&self.state).notifications_muted = !enabled;
    }

    pub fn subscription_attempts(&self) -> u32 {
        lock(&self.state).subscription_attempts
    }

    /// Registered hot-plug callbacks for a flow.
    pub fn device_watchers(&self, flow: DataFlow) -> usize {
        lock(&self.state)
            .device_sinks
            .iter()
            .filter(|(_, sink_flow, _)| *sink_flow == flow)
            .count()
    }

    /// Registered volume callbacks for an endpoint.
    pub fn volume_watchers(&self, device_id: &str) -> usize {
        let id = DeviceId::new(device_id);
        lock(&self.state)
            .volume_sinks
            .iter()
            .filter(|(_, sink_id, _)| *sink_id == id)
            .count()
    }

    fn update_hardware(&self, device_id: &DeviceId, apply: impl FnOnce(&mut VirtualEndpoint)) {
        let notification = {
            let mut state = lock(&self.state);
            let Some(endpoint) = state.endpoint_mut(device_id) else {
                return;
            };
            let before = (endpoint.muted, endpoint.volume);
            apply(endpoint);
            if before == (endpoint.muted, endpoint.volume) {
                None
            } else {
                let notification = VolumeNotification {
                    muted: endpoint.muted,
                    volume: endpoint.volume,
                };
                Some((notification, state.volume_sinks_for(device_id)))
            }
        };

        if let Some((notification, sinks)) = notification {
            for sink in sinks {
                sink(notification);
            }
        }
    }
}

impl EndpointBackend for VirtualBackend {
    fn enumerate(&self, flow: DataFlow) -> Result<Vec<DeviceDescriptor>, AudioError> {
        let state = lock(&self.state);
        if state.fail_enumeration {
            return Err(AudioError::EnumerationFailed(
                "virtual enumeration failure".to_string(),
            ));
        }

        Ok(state
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.flow == flow)
            .map(|endpoint| endpoint.descriptor.clone())
            .collect())
    }

    fn subscribe(&self, flow: DataFlow, sink: DeviceEventSink) -> Result<Subscription, AudioError> {
        let id = {
            let mut state = lock(&self.state);
            state.subscription_attempts += 1;
            if state.rejected_subscriptions > 0 {
                state.rejected_subscriptions -= 1;
                return Err(AudioError::SubscriptionFailed(
                    "virtual registration rejected".to_string(),
                ));
            }
            let id = state.next_sink_id;
            state.next_sink_id += 1;
            state.device_sinks.push((id, flow, Arc::new(sink)));
            id
        };

        let weak = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).device_sinks.retain(|(sink_id, _, _)| *sink_id != id);
            }
        }))
    }

    fn open(&self, device_id: &DeviceId) -> Result<Arc<dyn EndpointHandle>, AudioError> {
        let mut state = lock(&self.state);
        if state.endpoint_mut(device_id).is_none() {
            return Err(AudioError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }

        Ok(Arc::new(VirtualHandle {
            device_id: device_id.clone(),
            state: Arc::downgrade(&self.state),
        }))
    }
}

/// Handle onto one virtual endpoint.
struct VirtualHandle {
    device_id: DeviceId,
    state: Weak<Mutex<VirtualState>>,
}

impl VirtualHandle {
    fn gone(&self) -> AudioError {
        AudioError::HardwareCallFailed {
            device_id: self.device_id.to_string(),
            message: "endpoint is no longer present".to_string(),
        }
    }

    fn read<T>(&self, read: impl FnOnce(&VirtualEndpoint) -> T) -> Result<T, AudioError> {
        let state = self.state.upgrade().ok_or_else(|| self.gone())?;
        let mut guard = lock(&state);
        guard
            .endpoint_mut(&self.device_id)
            .map(|endpoint| read(endpoint))
            .ok_or_else(|| self.gone())
    }

    fn write(
        &self,
        count: impl FnOnce(&mut WriteCounts),
        apply: impl FnOnce(&mut VirtualEndpoint),
    ) -> Result<(), AudioError> {
        let state = self.state.upgrade().ok_or_else(|| self.gone())?;

        let pending = {
            let mut guard = lock(&state);
            let endpoint = guard
                .endpoint_mut(&self.device_id)
                .ok_or_else(|| self.gone())?;
            let before = (endpoint.muted, endpoint.volume);
            apply(endpoint);
            let after = VolumeNotification {
                muted: endpoint.muted,
                volume: endpoint.volume,
            };
            count(guard.writes.entry(self.device_id.clone()).or_default());

            if before == (after.muted, after.volume) {
                None
            } else {
                Some((after, guard.volume_sinks_for(&self.device_id)))
            }
        };

        // Real endpoints echo their own writes through the volume callback
        if let Some((notification, sinks)) = pending {
            for sink in sinks {
                sink(notification);
            }
        }
        Ok(())
    }
}

impl EndpointHandle for VirtualHandle {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn mute(&self) -> Result<bool, AudioError> {
        self.read(|endpoint| endpoint.muted)
    }

    fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        self.write(|counts| counts.mute += 1, |endpoint| endpoint.muted = muted)
    }

    fn volume(&self) -> Result<f32, AudioError> {
        self.read(|endpoint| endpoint.volume)
    }

    fn set_volume(&self, level: f32) -> Result<(), AudioError> {
        let level = level.clamp(0.0, 1.0);
        self.write(|counts| counts.volume += 1, |endpoint| endpoint.volume = level)
    }

    fn watch(&self, sink: VolumeSink) -> Result<Subscription, AudioError> {
        let state = self.state.upgrade().ok_or_else(|| self.gone())?;
        let id = {
            let mut guard = lock(&state);
            if guard.endpoint_mut(&self.device_id).is_none() {
                return Err(self.gone());
            }
            let id = guard.next_sink_id;
            guard.next_sink_id += 1;
            guard
                .volume_sinks
                .push((id, self.device_id.clone(), Arc::new(sink)));
            id
        };

        let weak = self.state.clone();
        Ok(Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).volume_sinks.retain(|(sink_id, _, _)| *sink_id != id);
            }
        }))
    }
}
