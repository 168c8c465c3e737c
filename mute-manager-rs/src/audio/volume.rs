//! Volume control using IAudioEndpointVolume.
//!
//! Provides the WASAPI [`EndpointHandle`] for one endpoint.

use super::backend::{EndpointHandle, VolumeSink};
use super::device::{AudioError, DeviceId};
use super::enumerator::ensure_com;
use super::notifications::VolumeNotificationClient;
use crate::events::Subscription;
use windows::Win32::Media::Audio::{Endpoints::IAudioEndpointVolume, IMMDevice};
use windows::Win32::System::Com::CLSCTX_ALL;

/// Volume controller for a specific device.
pub struct VolumeController {
    device_id: DeviceId,
    endpoint_volume: IAudioEndpointVolume,
}

// SAFETY: IAudioEndpointVolume is free-threaded and callers join the MTA via
// `ensure_com` before every call.
unsafe impl Send for VolumeController {}
unsafe impl Sync for VolumeController {}

impl VolumeController {
    /// Create a new VolumeController for the given device.
    pub fn new(device_id: DeviceId, device: &IMMDevice) -> Result<Self, AudioError> {
        unsafe {
            let endpoint_volume: IAudioEndpointVolume = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|_| AudioError::VolumeNotAvailable {
                    device_id: device_id.to_string(),
                })?;

            Ok(Self {
                device_id,
                endpoint_volume,
            })
        }
    }

    fn failed(&self, error: windows::core::Error) -> AudioError {
        AudioError::HardwareCallFailed {
            device_id: self.device_id.to_string(),
            message: error.to_string(),
        }
    }
}

impl EndpointHandle for VolumeController {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn mute(&self) -> Result<bool, AudioError> {
        ensure_com()?;
        unsafe {
            let muted = self
                .endpoint_volume
                .GetMute()
                .map_err(|e| self.failed(e))?;
            Ok(muted.as_bool())
        }
    }

    fn set_mute(&self, muted: bool) -> Result<(), AudioError> {
        ensure_com()?;
        unsafe {
            self.endpoint_volume
                .SetMute(muted, std::ptr::null())
                .map_err(|e| self.failed(e))?;
            Ok(())
        }
    }

    fn volume(&self) -> Result<f32, AudioError> {
        ensure_com()?;
        unsafe {
            let level = self
                .endpoint_volume
                .GetMasterVolumeLevelScalar()
                .map_err(|e| self.failed(e))?;
            Ok(level)
        }
    }

    fn set_volume(&self, level: f32) -> Result<(), AudioError> {
        ensure_com()?;
        let level = level.clamp(0.0, 1.0);
        unsafe {
            self.endpoint_volume
                .SetMasterVolumeLevelScalar(level, std::ptr::null())
                .map_err(|e| self.failed(e))?;
            Ok(())
        }
    }

    fn watch(&self, sink: VolumeSink) -> Result<Subscription, AudioError> {
        ensure_com()?;
        let registration = VolumeNotificationClient::new(sink)
            .register(&self.endpoint_volume)
            .map_err(|e| self.failed(e))?;
        Ok(Subscription::new(move || registration.unregister()))
    }
}
