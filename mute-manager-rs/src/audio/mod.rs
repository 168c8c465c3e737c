//! Audio module for endpoint enumeration and hardware volume control.
//!
//! The data model and backend traits are platform-independent. The WASAPI
//! backend (enumerator, notifications, volume) is only built on Windows.

pub mod backend;
pub mod device;
pub mod virtual_backend;

#[cfg(windows)]
pub mod enumerator;
#[cfg(windows)]
pub mod notifications;
#[cfg(windows)]
pub mod volume;

pub use backend::{default_backend, DeviceEventSink, EndpointBackend, EndpointHandle, VolumeSink};
pub use device::{
    AudioError, DataFlow, DeviceDescriptor, DeviceEvent, DeviceId, DeviceRole, DeviceState,
    VolumeNotification,
};
pub use virtual_backend::VirtualBackend;

#[cfg(windows)]
pub use enumerator::WasapiBackend;
