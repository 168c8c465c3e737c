//! Audio Endpoint Mute Manager - Library
//!
//! Tracks the audio endpoints of the host and controls their mute and volume,
//! one device at a time or all of them together.
//!
//! ## Features
//!
//! - Live, hot-plug aware endpoint registry per data flow (capture/render)
//! - Per-device controllers with rate-limited hardware change notifications
//! - "All devices" aggregate, either derived (AND/MIN) or synchronizing
//! - Late-joining devices inherit the session's mute and volume
//! - Selection façade that falls back to the aggregate for absent devices
//! - WASAPI backend on Windows, in-memory backend everywhere else

pub mod app;
pub mod audio;
pub mod config;
pub mod controller;
pub mod events;
pub mod registry;
pub mod sampling;

#[cfg(test)]
mod test_support;

pub use app::{AppState, Command, DeviceSummary, FlowStatus};
pub use audio::{
    default_backend, AudioError, DataFlow, DeviceDescriptor, DeviceEvent, DeviceId,
    EndpointBackend, EndpointHandle, VirtualBackend,
};
pub use config::{AggregateMode, EngineConfig, RegistryConfig};
pub use controller::{
    AggregateController, ComplexController, ControlEvent, SingleDeviceController, SyncStats,
    SynchronizingAggregateController, VolumeControl,
};
pub use events::{Notifier, Subscription};
pub use registry::{DeviceRegistry, LiveSetChange};
