//! Backend seam between the controller engine and the OS audio stack.
//!
//! The registry and controllers only talk to these traits. The WASAPI
//! implementation lives next to this module on Windows; the virtual backend
//! serves every other host and the test suites.

use super::device::{AudioError, DataFlow, DeviceDescriptor, DeviceEvent, DeviceId, VolumeNotification};
use crate::events::Subscription;
use std::sync::Arc;

/// Callback receiving hot-plug notifications on a backend thread.
pub type DeviceEventSink = Box<dyn Fn(DeviceEvent) + Send + Sync>;

/// Callback receiving hardware volume/mute changes on a backend thread.
pub type VolumeSink = Box<dyn Fn(VolumeNotification) + Send + Sync>;

/// Source of endpoints for one host audio system.
pub trait EndpointBackend: Send + Sync {
    /// Active endpoints of `flow`. Does not include the "all devices" entry.
    fn enumerate(&self, flow: DataFlow) -> Result<Vec<DeviceDescriptor>, AudioError>;

    /// Register for hot-plug notifications. Dropping the subscription
    /// unregisters the callback.
    fn subscribe(&self, flow: DataFlow, sink: DeviceEventSink) -> Result<Subscription, AudioError>;

    /// Acquire a hardware handle for an endpoint.
    fn open(&self, device_id: &DeviceId) -> Result<Arc<dyn EndpointHandle>, AudioError>;
}

/// Hardware volume control for one endpoint.
///
/// Calls fail with [`AudioError::HardwareCallFailed`] once the device is gone.
pub trait EndpointHandle: Send + Sync {
    fn device_id(&self) -> &DeviceId;

    fn mute(&self) -> Result<bool, AudioError>;

    fn set_mute(&self, muted: bool) -> Result<(), AudioError>;

    /// Master volume scalar (0.0 to 1.0).
    fn volume(&self) -> Result<f32, AudioError>;

    /// Set the master volume; values are clamped to 0.0..=1.0.
    fn set_volume(&self, level: f32) -> Result<(), AudioError>;

    /// Register for hardware volume/mute notifications.
    fn watch(&self, sink: VolumeSink) -> Result<Subscription, AudioError>;
}

/// The backend for the current host.
#[cfg(windows)]
pub fn default_backend() -> Result<Arc<dyn EndpointBackend>, AudioError> {
    let backend = super::enumerator::WasapiBackend::new()?;
    Ok(Arc::new(backend))
}

/// The backend for the current host.
#[cfg(not(windows))]
pub fn default_backend() -> Result<Arc<dyn EndpointBackend>, AudioError> {
    tracing::warn!("No native endpoint backend for this platform, using an empty virtual backend");
    Ok(Arc::new(super::virtual_backend::VirtualBackend::new()))
}
