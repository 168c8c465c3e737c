//! Device change notifications using IMMNotificationClient and
//! IAudioEndpointVolumeCallback.
//!
//! Both callbacks run on threads owned by the audio service. They only forward
//! into sinks; all state changes happen on the consumer side.

use super::backend::{DeviceEventSink, VolumeSink};
use super::device::{DataFlow, DeviceEvent, DeviceRole, DeviceState, VolumeNotification};
use super::enumerator::{ensure_com, to_edataflow};
use windows::core::{implement, PCWSTR};
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::{
    eCommunications, eConsole, EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient,
    IMMNotificationClient_Impl, AUDIO_VOLUME_NOTIFICATION_DATA, DEVICE_STATE,
};
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

/// Notification client that forwards hot-plug events to a sink.
#[implement(IMMNotificationClient)]
pub struct DeviceNotificationClient {
    flow: DataFlow,
    sink: DeviceEventSink,
}

impl DeviceNotificationClient {
    pub fn new(flow: DataFlow, sink: DeviceEventSink) -> Self {
        Self { flow, sink }
    }

    /// Register this notification client with an enumerator.
    /// Takes ownership of self because the COM interface needs to own the data.
    pub fn register(
        self,
        enumerator: &IMMDeviceEnumerator,
    ) -> Result<DeviceNotificationRegistration, windows::core::Error> {
        unsafe {
            let client: IMMNotificationClient = self.into();
            enumerator.RegisterEndpointNotificationCallback(&client)?;
            Ok(DeviceNotificationRegistration {
                enumerator: enumerator.clone(),
                client,
            })
        }
    }

    fn convert_role(role: ERole) -> DeviceRole {
        if role == eConsole {
            DeviceRole::Console
        } else if role == eCommunications {
            DeviceRole::Communications
        } else {
            DeviceRole::Multimedia
        }
    }

    fn convert_state(state: DEVICE_STATE) -> DeviceState {
        match state.0 {
            1 => DeviceState::Active,
            2 => DeviceState::Disabled,
            4 => DeviceState::NotPresent,
            8 => DeviceState::Unplugged,
            _ => DeviceState::NotPresent,
        }
    }
}

impl IMMNotificationClient_Impl for DeviceNotificationClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                (self.sink)(DeviceEvent::DeviceStateChanged {
                    device_id: id,
                    new_state: DeviceNotificationClient::convert_state(dwnewstate),
                });
            }
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                (self.sink)(DeviceEvent::DeviceAdded { device_id: id });
            }
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        unsafe {
            if let Ok(id) = pwstrdeviceid.to_string() {
                (self.sink)(DeviceEvent::DeviceRemoved { device_id: id });
            }
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        if flow != to_edataflow(self.flow) {
            return Ok(());
        }

        unsafe {
            let device_id = if pwstrdefaultdeviceid.is_null() {
                None
            } else {
                pwstrdefaultdeviceid.to_string().ok()
            };

            (self.sink)(DeviceEvent::DefaultDeviceChanged {
                flow: self.flow,
                role: DeviceNotificationClient::convert_role(role),
                device_id,
            });
        }
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// A registered notification client; unregistered by [`Self::unregister`].
pub struct DeviceNotificationRegistration {
    enumerator: IMMDeviceEnumerator,
    client: IMMNotificationClient,
}

// SAFETY: the enumerator and our own client object are free-threaded; the
// registration is only touched again from the thread dropping the subscription,
// which joins the MTA first.
unsafe impl Send for DeviceNotificationRegistration {}

impl DeviceNotificationRegistration {
    pub fn unregister(self) {
        let _ = ensure_com();
        unsafe {
            let _ = self
                .enumerator
                .UnregisterEndpointNotificationCallback(&self.client);
        }
    }
}

/// Volume callback that forwards mute/volume changes to a sink.
#[implement(IAudioEndpointVolumeCallback)]
pub struct VolumeNotificationClient {
    sink: VolumeSink,
}

impl VolumeNotificationClient {
    pub fn new(sink: VolumeSink) -> Self {
        Self { sink }
    }

    pub fn register(
        self,
        endpoint_volume: &IAudioEndpointVolume,
    ) -> Result<VolumeNotificationRegistration, windows::core::Error> {
        unsafe {
            let callback: IAudioEndpointVolumeCallback = self.into();
            endpoint_volume.RegisterControlChangeNotify(&callback)?;
            Ok(VolumeNotificationRegistration {
                endpoint_volume: endpoint_volume.clone(),
                callback,
            })
        }
    }
}

impl IAudioEndpointVolumeCallback_Impl for VolumeNotificationClient_Impl {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        if pnotify.is_null() {
            return Ok(());
        }

        let data = unsafe { &*pnotify };
        (self.sink)(VolumeNotification {
            muted: data.bMuted.as_bool(),
            volume: data.fMasterVolume,
        });
        Ok(())
    }
}

/// A registered volume callback; unregistered by [`Self::unregister`].
pub struct VolumeNotificationRegistration {
    endpoint_volume: IAudioEndpointVolume,
    callback: IAudioEndpointVolumeCallback,
}

// SAFETY: IAudioEndpointVolume is free-threaded, see DeviceNotificationRegistration.
unsafe impl Send for VolumeNotificationRegistration {}

impl VolumeNotificationRegistration {
    pub fn unregister(self) {
        let _ = ensure_com();
        unsafe {
            let _ = self
                .endpoint_volume
                .UnregisterControlChangeNotify(&self.callback);
        }
    }
}
