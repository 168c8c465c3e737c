//! Audio endpoint data models.
//!
//! Defines the identifiers and snapshots the registry publishes, the hot-plug
//! and volume notifications backends deliver, and the error type shared by
//! every backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Direction of audio data through an endpoint (maps to Windows EDataFlow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFlow {
    /// Microphones and other recording endpoints
    Capture,

    /// Speakers, headphones and other playback endpoints
    Render,
}

impl DataFlow {
    /// Both flows, capture first.
    pub const ALL: [DataFlow; 2] = [DataFlow::Capture, DataFlow::Render];

    /// Parse the short names used on command lines and across FFI.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "capture" | "input" | "mic" => Some(DataFlow::Capture),
            "render" | "output" | "speaker" => Some(DataFlow::Render),
            _ => None,
        }
    }
}

impl fmt::Display for DataFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFlow::Capture => f.write_str("capture"),
            DataFlow::Render => f.write_str("render"),
        }
    }
}

/// Identifier of an endpoint, or the synthetic "all devices" selector.
///
/// Equality and hashing use the endpoint id string only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Sentinel id of the aggregate "all devices" entry.
    pub const ALL: &'static str = "{all-devices}";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The "all devices" selector.
    pub fn all() -> Self {
        Self(Self::ALL.to_string())
    }

    /// No selection.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for ids that can be bound to hardware.
    pub fn is_endpoint(&self) -> bool {
        !self.is_empty() && !self.is_all()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Snapshot of one endpoint, produced fresh on every enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique endpoint id (opaque string from IMMDevice::GetId)
    pub id: DeviceId,

    /// Human-readable device name (from device properties)
    pub name: String,
}

impl DeviceDescriptor {
    /// Display name of the synthetic aggregate entry.
    pub const ALL_NAME: &'static str = "All Devices";

    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// The synthetic "all devices" entry.
    pub fn all() -> Self {
        Self::new(DeviceId::all(), Self::ALL_NAME)
    }
}

/// Audio device role (maps to Windows ERole enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceRole {
    /// Used by games, system sounds, most general applications
    Console = 0,

    /// Used by music players, video players
    Multimedia = 1,

    /// Used by Teams, Zoom, Discord, and other VoIP applications
    Communications = 2,
}

/// Windows device state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
}

/// Hot-plug notifications from the audio system.
///
/// The registry only uses these as triggers for a re-enumeration; payloads
/// end up in logs.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A new audio device was connected
    DeviceAdded { device_id: String },

    /// An audio device was disconnected
    DeviceRemoved { device_id: String },

    /// Device state changed (active, disabled, not present, unplugged)
    DeviceStateChanged {
        device_id: String,
        new_state: DeviceState,
    },

    /// Default device changed for a specific role
    DefaultDeviceChanged {
        flow: DataFlow,
        role: DeviceRole,
        device_id: Option<String>, // None if no default device
    },
}

/// Hardware-side volume or mute change of a bound endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeNotification {
    pub muted: bool,

    /// Master volume scalar (0.0 to 1.0)
    pub volume: f32,
}

/// Audio backend error types.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("COM initialization failed: {0}")]
    ComInitFailed(String),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to register for device notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Volume control not available for device {device_id}")]
    VolumeNotAvailable { device_id: String },

    #[error("Hardware call failed on {device_id}: {message}")]
    HardwareCallFailed { device_id: String, message: String },

    #[error("String conversion error: {0}")]
    StringConversion(String),
}
